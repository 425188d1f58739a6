//! Tests that run the dynbuild binary.

use super::*;

fn write_project(space: &TestSpace, json: &str) -> anyhow::Result<()> {
    space.write("project.json", &json.replace("$ROOT", &space.root()))?;
    Ok(())
}

const COPY_ONLY: &str = r#"{
    "name": "Demo",
    "settings": {"PROJECT_DIR": "$ROOT"},
    "targets": [
        {"name": "Data", "product_type": "aggregate",
         "phases": [{"kind": "copy-files", "destination": "share", "files": [{"path": "data.txt"}]}]}
    ]
}"#;

#[test]
fn build_then_nothing_to_do() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_project(&space, COPY_ONLY)?;
    space.write("data.txt", "payload")?;

    let out = space.run_expect(&mut dynbuild_command(vec!["build", "project.json"]))?;
    assert_output_contains(&out, "ran 1 tasks, now up to date");
    assert_eq!(space.read("build/Products/debug/share/data.txt")?, b"payload");

    let out = space.run_expect(&mut dynbuild_command(vec!["build", "project.json"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn describe_lists_tasks() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_project(&space, COPY_ONLY)?;
    let out = space.run_expect(&mut dynbuild_command(vec!["describe", "project.json"]))?;
    assert_output_contains(&out, "Copy ");
    assert_output_contains(&out, "Gate Data-begin");
    Ok(())
}

#[test]
fn unknown_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    write_project(&space, COPY_ONLY)?;
    let out = space.run(&mut dynbuild_command(vec!["build", "project.json", "Missing"]))?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Missing"));
    Ok(())
}

#[test]
fn merge_dependency_info() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("b.json", r#"{"targetName": "B", "projectName": "P"}"#)?;
    space.write(
        "a.json",
        r#"{"targetName": "A", "projectName": "P", "outputPaths": ["/out/A"]}"#,
    )?;
    space.run_expect(&mut dynbuild_command(vec![
        "merge-dependency-info",
        "-o",
        "merged.json",
        "b.json",
        "a.json",
    ]))?;
    let merged: serde_json::Value = serde_json::from_slice(&space.read("merged.json")?)?;
    assert_eq!(merged["targets"][0]["targetName"], "A");
    assert_eq!(merged["targets"][0]["outputPaths"][0], "/out/A");
    assert_eq!(merged["targets"][1]["targetName"], "B");
    Ok(())
}

#[test]
fn merge_reports_duplicates() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.json", r#"{"targetName": "A", "projectName": "P"}"#)?;
    let out = space.run(&mut dynbuild_command(vec![
        "merge-dependency-info",
        "-o",
        "merged.json",
        "a.json",
        "a.json",
    ]))?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr)
        .contains("Found multiple identical targets named 'A' in project 'P'"));
    Ok(())
}

#[test]
fn verify_trace() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "trace.json",
        r#"{"dynamic": ["/usr/lib/libFoo.dylib", "/usr/lib/libBar.dylib", "/usr/lib/libSystem.B.tbd"]}"#,
    )?;
    let out = space.run(&mut dynbuild_command(vec![
        "verify-trace",
        "--trace",
        "trace.json",
        "--declared",
        "libFoo.dylib",
        "--target",
        "App",
    ]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "[App] Undeclared dependency: libBar.dylib");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(!stdout.contains("libFoo"));

    let out = space.run_expect(&mut dynbuild_command(vec![
        "verify-trace",
        "--trace",
        "trace.json",
        "--declared",
        "libFoo.dylib",
        "--declared",
        "Bar",
    ]))?;
    assert!(out.stdout.is_empty());
    Ok(())
}
