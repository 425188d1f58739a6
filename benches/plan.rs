use criterion::{criterion_group, criterion_main, Criterion};
use dynbuild::description::DescriptionBuilder;
use dynbuild::description_cache::DescriptionCache;
use dynbuild::producer::ProducerRegistry;
use dynbuild::project::{BuildRequest, Project};
use std::sync::Arc;

/// A project of `n` frameworks, each depending on the previous two, plus an
/// app on top of all of them.
fn generate(n: usize) -> Project {
    let mut targets = Vec::new();
    for i in 0..n {
        let deps: Vec<String> = (i.saturating_sub(2)..i).map(|d| format!("\"Lib{}\"", d)).collect();
        let sources: Vec<String> = (0..20)
            .map(|s| format!("{{\"path\": \"lib{}/file{}.c\"}}", i, s))
            .collect();
        targets.push(format!(
            r#"{{"name": "Lib{i}", "product_type": "framework", "dependencies": [{deps}],
                "phases": [
                    {{"kind": "sources", "files": [{sources}]}},
                    {{"kind": "resources", "files": [{{"path": "lib{i}/Info.plist"}}]}}]}}"#,
            i = i,
            deps = deps.join(", "),
            sources = sources.join(", "),
        ));
    }
    let all: Vec<String> = (0..n).map(|i| format!("\"Lib{}\"", i)).collect();
    targets.push(format!(
        r#"{{"name": "App", "product_type": "application", "dependencies": [{}],
            "phases": [{{"kind": "sources", "files": [{{"path": "main.c"}}]}}]}}"#,
        all.join(", ")
    ));
    let json = format!(
        r#"{{"name": "Bench", "settings": {{"PROJECT_DIR": "/src/bench"}}, "targets": [{}]}}"#,
        targets.join(",\n")
    );
    serde_json::from_str(&json).unwrap()
}

fn request() -> BuildRequest {
    BuildRequest {
        targets: vec!["App".to_string()],
        ..Default::default()
    }
}

pub fn bench_plan(c: &mut Criterion) {
    let project = generate(50);
    let registry = Arc::new(ProducerRegistry::standard());

    let serial = DescriptionBuilder::new(registry.clone(), 1);
    c.bench_function("plan 50 targets serial", |b| {
        b.iter(|| serial.build(&project, &request()).unwrap())
    });

    let parallel = DescriptionBuilder::new(registry.clone(), 8);
    c.bench_function("plan 50 targets parallel", |b| {
        b.iter(|| parallel.build(&project, &request()).unwrap())
    });

    let cache = DescriptionCache::new(DescriptionBuilder::new(registry, 8), 4);
    c.bench_function("plan 50 targets cached", |b| {
        b.iter(|| {
            let (description, _) = cache.get_or_build(&project, &request()).unwrap();
            cache.release(&description.signature);
        })
    });
}

pub fn bench_canon(c: &mut Criterion) {
    c.bench_function("canon with parents", |b| {
        b.iter(|| {
            dynbuild::canon::canon_path(
                "/src/bench/build/Intermediates/Lib12.build/../Lib12.build/\
                 ./Objects/arm64/../arm64/file17.o",
            );
        })
    });
}

criterion_group!(benches, bench_plan, bench_canon);
criterion_main!(benches);
