//! Builds of small projects through the engine, with a fake compiler.

use super::*;
use dynbuild::coordinator::{DynamicRequest, DynamicTaskContext, DynamicTaskKey, Priority};
use dynbuild::db::Staleness;
use dynbuild::depinfo::{BuildDependencyInfo, Dependency};
use dynbuild::description::DescriptionBuilder;
use dynbuild::description_cache::CacheStatus;
use dynbuild::graph::Command;
use dynbuild::module_graph::{AccessLevel, ModuleGraphFlavor};
use dynbuild::settings;

const APP_AND_LIB: &str = r#"{
    "name": "Demo",
    "settings": {"PROJECT_DIR": "$ROOT"},
    "targets": [
        {"name": "App", "product_type": "application", "dependencies": ["Lib"],
         "phases": [
            {"kind": "sources", "files": [{"path": "main.c"}, {"path": "util.c"}, {"path": "view.m"}]},
            {"kind": "resources", "files": [{"path": "icon.png"}]}]},
        {"name": "Lib", "product_type": "dynamic-library",
         "phases": [{"kind": "sources", "files": [{"path": "lib.c"}]}]}
    ]
}"#;

fn app_and_lib(space: &TestSpace) -> anyhow::Result<Project> {
    for file in ["main.c", "util.c", "view.m", "lib.c", "icon.png"] {
        space.write(file, file)?;
    }
    Ok(space.project(APP_AND_LIB))
}

fn staleness(engine: &Engine, project: &Project, identifier: &str) -> Staleness {
    let (description, _) = engine.describe(project, &request(&["App"])).unwrap();
    let task = description
        .graph
        .tasks()
        .map(|(_, task)| task)
        .find(|task| task.identifier() == identifier)
        .unwrap_or_else(|| panic!("no task {}", identifier));
    let staleness = engine
        .db()
        .staleness(
            &RealFileSystem::new(),
            identifier,
            &task.signature,
            task.real_inputs(),
            task.real_outputs(),
        )
        .unwrap();
    engine.release(&description);
    staleness
}

#[test]
fn scans_once_per_plan() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let scanner = Arc::new(FakeScanner::new(&space));
    let mut engine = engine(scanner.clone());
    let spawner = FakeSpawner::default();

    build(&mut engine, &project, &request(&["App"]), &spawner)?;
    // Three compile tasks of App ask for the same scan.
    assert_eq!(scanner.scans("App-arm64-debug"), 1);
    assert_eq!(scanner.scans("Lib-arm64-debug"), 1);
    assert_eq!(engine.coordinator().systems().clang.scan_count(), 2);

    let commands = spawner.take();
    let compiles = commands.iter().filter(|c| c[0] == "cc").count();
    assert_eq!(compiles, 4);
    assert!(std::path::Path::new(&scanner.object_path("App", "view.m")).exists());
    assert!(std::path::Path::new(&space.path("build/Products/debug/App.app/Resources/icon.png")).exists());
    Ok(())
}

#[test]
fn dependencies_link_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let spawner = FakeSpawner::default();
    build(&mut engine, &project, &request(&["App"]), &spawner)?;

    let links: Vec<String> = spawner
        .take()
        .into_iter()
        .filter(|c| c[0] == "ld")
        .map(|c| c[c.iter().position(|a| a == "-o").unwrap() + 1].clone())
        .collect();
    assert_eq!(
        links,
        vec![
            space.path("build/Products/debug/libLib.dylib"),
            space.path("build/Products/debug/App.app/App"),
        ]
    );
    Ok(())
}

#[test]
fn second_build_does_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let spawner = FakeSpawner::default();

    let first = build(&mut engine, &project, &request(&["App"]), &spawner)?;
    assert!(first.ran > 0);
    spawner.take();

    let second = build(&mut engine, &project, &request(&["App"]), &spawner)?;
    assert_eq!(second.ran, 0);
    assert!(spawner.take().is_empty());
    // The unchanged request reused its description.
    assert_eq!(engine.descriptions().stats().hits, 1);
    Ok(())
}

#[test]
fn changed_dependency_relinks_dependents_only() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let mut project = app_and_lib(&space)?;
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let spawner = FakeSpawner::default();
    build(&mut engine, &project, &request(&["App"]), &spawner)?;
    spawner.take();

    let lib = project.targets.iter_mut().find(|t| t.name == "Lib").unwrap();
    lib.settings.set(settings::PRODUCT_NAME, "Core");

    let link = format!("Ld {}", space.path("build/Products/debug/App.app/App"));
    let resource = format!(
        "CpResource {} {}",
        space.path("build/Products/debug/App.app/Resources/icon.png"),
        space.path("icon.png")
    );
    assert_eq!(staleness(&engine, &project, &link), Staleness::RuleChanged);
    assert_eq!(staleness(&engine, &project, &resource), Staleness::UpToDate);

    build(&mut engine, &project, &request(&["App"]), &spawner)?;
    let commands = spawner.take();
    assert_eq!(commands.len(), 2, "{:?}", commands);
    assert!(commands.iter().all(|c| c[0] == "ld"));
    assert!(commands[0].contains(&space.path("build/Products/debug/libCore.dylib")));
    assert!(commands[1].contains(&space.path("build/Products/debug/libCore.dylib")));
    Ok(())
}

#[test]
fn descriptions_are_deterministic() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let registry = Arc::new(ProducerRegistry::standard());
    let serial = DescriptionBuilder::new(registry.clone(), 1).build(&project, &request(&["App"]))?;
    let parallel = DescriptionBuilder::new(registry, 8).build(&project, &request(&["App"]))?;
    assert_eq!(serial.signature, parallel.signature);
    assert_eq!(serial.task_signatures(), parallel.task_signatures());
    assert!(serial.diagnostics.is_empty());
    Ok(())
}

#[test]
fn unchanged_request_hits_description_cache() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let engine = engine(Arc::new(FakeScanner::new(&space)));
    let (first, status) = engine.describe(&project, &request(&["App"]))?;
    assert_eq!(status, CacheStatus::Miss);
    let (second, status) = engine.describe(&project, &request(&["App"]))?;
    assert_eq!(status, CacheStatus::Hit);
    assert!(Arc::ptr_eq(&first, &second));
    engine.release(&first);
    engine.release(&second);

    let mut other = project.clone();
    other.settings.set(settings::CONFIGURATION, "release");
    let (third, status) = engine.describe(&other, &request(&["App"]))?;
    assert_eq!(status, CacheStatus::Miss);
    assert_ne!(third.signature, first.signature);
    engine.release(&third);
    Ok(())
}

#[test]
fn concurrent_requests_share_one_task() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let coordinator = DynamicTaskContext::new(Arc::new(FakeScanner::new(&space)), None);
    let key = DynamicTaskKey::ModuleScan(ScanRequest {
        flavor: ModuleGraphFlavor::Clang,
        plan_id: "App-arm64-debug".into(),
        module_name: "App".into(),
        command: Command::new(["clang"]),
        sources: vec![space.path("main.c")],
        caching: false,
    });
    let created: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    matches!(
                        coordinator.request_task(key.clone(), Priority::Normal),
                        Ok(DynamicRequest::New { .. })
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum()
    });
    assert_eq!(created, 1);
    assert_eq!(coordinator.request_count(), 1);
    Ok(())
}

#[test]
fn undeclared_library_fails_verification() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "")?;
    space.write("sdk/libFoo.dylib", "")?;
    let project = space.project(
        r#"{
            "name": "Demo",
            "settings": {"PROJECT_DIR": "$ROOT"},
            "targets": [
                {"name": "App", "product_type": "tool",
                 "settings": {"VALIDATE_LINK_DEPENDENCIES": "YES_ERROR"},
                 "phases": [
                    {"kind": "sources", "files": [{"path": "main.c"}]},
                    {"kind": "frameworks", "files": [{"path": "$ROOT/sdk/libFoo.dylib"}]}]}
            ]
        }"#,
    );
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let spawner = FakeSpawner::with_trace(
        r#"{"dynamic": ["/sdk/libFoo.dylib", "/usr/lib/libBar.dylib", "/usr/lib/libSystem.B.tbd"]}"#,
    );
    let summary = engine.build(
        &project,
        &request(&["App"]),
        &spawner,
        &RealFileSystem::new(),
        &CancellationToken::new(),
    )?;
    assert!(!summary.success());
    let undeclared: Vec<&str> = summary
        .diagnostics
        .iter()
        .filter(|d| d.is_error())
        .map(|d| d.message.as_str())
        .collect();
    assert_eq!(
        undeclared,
        vec!["Undeclared dependency: libBar.dylib (linked from /usr/lib/libBar.dylib)"]
    );
    Ok(())
}

#[test]
fn dependency_info_report() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let report = space.path("deps.json");
    let request = BuildRequest {
        dependency_info_output: Some(report.clone()),
        ..request(&["App"])
    };
    build(&mut engine, &project, &request, &FakeSpawner::default())?;

    let info = BuildDependencyInfo::from_json(&space.read("deps.json")?)?;
    assert!(info.errors.is_empty());
    let names: Vec<&str> = info.targets.iter().map(|t| t.target_name.as_str()).collect();
    assert_eq!(names, vec!["App", "Lib"]);
    assert_eq!(
        info.targets[1].output_paths,
        vec![space.path("build/Products/debug/libLib.dylib")]
    );
    Ok(())
}

#[test]
fn dependency_info_lists_discovered_imports() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let scanner = Arc::new(FakeScanner::new(&space));
    scanner.add_import("App", "Lib", &space.path("main.c"));
    scanner.add_include("App", "/sdk/usr/include/stdio.h");
    let mut engine = engine(scanner);
    let report = space.path("deps.json");
    let request = BuildRequest {
        dependency_info_output: Some(report.clone()),
        ..request(&["App"])
    };
    build(&mut engine, &project, &request, &FakeSpawner::default())?;

    let info = BuildDependencyInfo::from_json(&space.read("deps.json")?)?;
    assert_eq!(
        info.targets[0].dependencies,
        vec![
            Dependency::Include {
                path: "/sdk/usr/include/stdio.h".into()
            },
            Dependency::Import {
                name: "Lib".into(),
                access_level: AccessLevel::Public,
                optional: false,
            },
        ]
    );
    assert!(info.targets[1].dependencies.is_empty());
    Ok(())
}

#[test]
fn indexing_builds_no_products() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let project = app_and_lib(&space)?;
    let mut engine = engine(Arc::new(FakeScanner::new(&space)));
    let request = BuildRequest {
        command: dynbuild::project::BuildCommand::PrepareForIndexing,
        ..request(&["App"])
    };
    let spawner = FakeSpawner::default();
    build(&mut engine, &project, &request, &spawner)?;
    assert!(spawner.take().iter().all(|c| c[0] != "ld"));
    assert!(!std::path::Path::new(&space.path("build/Products/debug/App.app")).exists());
    Ok(())
}

#[test]
fn swift_module_reports_undeclared_imports() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    for file in ["main.swift", "views.swift", "kit.c"] {
        space.write(file, file)?;
    }
    let project = space.project(
        r#"{
            "name": "Demo",
            "settings": {"PROJECT_DIR": "$ROOT"},
            "targets": [
                {"name": "App", "product_type": "tool",
                 "settings": {"VALIDATE_MODULE_DEPENDENCIES": "YES"},
                 "phases": [{"kind": "sources", "files": [{"path": "main.swift"}, {"path": "views.swift"}]}]},
                {"name": "Kit", "product_type": "dynamic-library",
                 "phases": [{"kind": "sources", "files": [{"path": "kit.c"}]}]}
            ]
        }"#,
    );
    let scanner = Arc::new(FakeScanner::new(&space));
    scanner.add_import("App", "Kit", &space.path("main.swift"));
    let mut engine = engine(scanner.clone());
    let spawner = FakeSpawner::default();
    let summary = build(&mut engine, &project, &request(&["App", "Kit"]), &spawner)?;

    assert_eq!(scanner.scans("App-arm64-debug"), 1);
    let compiles = spawner.take().into_iter().filter(|c| c[0] == "cc").count();
    assert_eq!(compiles, 3);
    assert!(std::path::Path::new(&scanner.object_path("App", "views.swift")).exists());

    let warnings: Vec<&str> = summary
        .diagnostics
        .iter()
        .filter(|d| d.severity == dynbuild::diagnostic::Severity::Warning)
        .map(|d| d.message.as_str())
        .collect();
    assert!(warnings.contains(&"Missing entry in MODULE_DEPENDENCIES: public Kit"), "{:?}", warnings);
    assert!(warnings.contains(
        &"'App' is missing a dependency on 'Kit' because dependency scan of 'App-arm64-debug' discovered a dependency on 'Kit'"
    ));
    Ok(())
}
