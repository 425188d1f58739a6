//! Compilation caching across builds and machines.

use super::*;
use dynbuild::cas::{
    CacheSetup, CachedCompilation, CachedOutput, CompilationCache, ContentStore, Digest,
    MemoryCas, OutputDescriptor, RemoteCache,
};
use dynbuild::error::CacheError;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A remote cache held in memory that counts its downloads.
#[derive(Default)]
struct FakeRemote {
    cas: MemoryCas,
    fetches: AtomicUsize,
}

impl FakeRemote {
    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Publishes an object for a compilation key.
    fn seed(&self, key: &str, object: &[u8]) -> Digest {
        let digest = self.cas.store(object).unwrap();
        self.cas
            .put_action(&CachedCompilation {
                key: key.to_string(),
                outputs: vec![CachedOutput {
                    descriptor: OutputDescriptor {
                        digest,
                        kind: "object".into(),
                    },
                    materialized: false,
                }],
            })
            .unwrap();
        digest
    }
}

impl RemoteCache for FakeRemote {
    fn lookup(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError> {
        self.cas.get_action(key)
    }

    fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(10));
        self.cas.load(digest)
    }

    fn upload_blob(&self, data: &[u8]) -> Result<Digest, CacheError> {
        self.cas.store(data)
    }

    fn publish(&self, entry: &CachedCompilation) -> Result<(), CacheError> {
        self.cas.put_action(entry)
    }
}

const CACHED_TOOL: &str = r#"{
    "name": "Demo",
    "settings": {"PROJECT_DIR": "$ROOT", "ENABLE_COMPILE_CACHE": "YES"},
    "targets": [
        {"name": "Tool", "product_type": "tool",
         "phases": [{"kind": "sources", "files": [{"path": "main.c"}]}]}
    ]
}"#;

fn caching_engine(scanner: Arc<FakeScanner>, remote: Arc<FakeRemote>) -> Engine {
    let config = EngineConfig {
        parallelism: 4,
        ..Default::default()
    };
    let setup = CacheSetup {
        store: Arc::new(MemoryCas::new()),
        remote: Some(remote),
        budget_bytes: None,
    };
    Engine::with_parts(
        config,
        scanner,
        ProducerRegistry::standard(),
        Some(setup),
        Db::in_memory(),
    )
}

#[test]
fn remote_hit_replays_without_compiling() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "int main() {}")?;
    let project = space.project(CACHED_TOOL);
    let remote = Arc::new(FakeRemote::default());
    remote.seed(&format!("ck {}", space.path("main.c")), b"cached object");

    let scanner = Arc::new(FakeScanner::new(&space));
    let mut engine = caching_engine(scanner.clone(), remote.clone());
    let spawner = FakeSpawner::default();
    let summary = build(&mut engine, &project, &request(&["Tool"]), &spawner)?;

    let commands = spawner.take();
    assert!(commands.iter().all(|c| c[0] != "cc"), "{:?}", commands);
    assert!(commands.iter().any(|c| c[0] == "ld"));
    assert!(summary.cache_hits > 0);
    assert_eq!(remote.fetches(), 1);
    let object = std::fs::read(scanner.object_path("Tool", "main.c"))?;
    assert_eq!(object, b"cached object");

    // The cache configuration landed next to the target's intermediates.
    let config = space.read("build/Intermediates/Tool.build/.cas-config")?;
    let config: serde_json::Value = serde_json::from_slice(&config)?;
    assert!(config["CASPath"]
        .as_str()
        .unwrap()
        .ends_with("CompilationCache.noindex"));
    Ok(())
}

#[test]
fn compiled_outputs_are_shared() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "int main() {}")?;
    let project = space.project(CACHED_TOOL);
    let remote = Arc::new(FakeRemote::default());
    let scanner = Arc::new(FakeScanner::new(&space));

    // The first machine compiles and publishes.
    let mut first = caching_engine(scanner.clone(), remote.clone());
    let spawner = FakeSpawner::default();
    build(&mut first, &project, &request(&["Tool"]), &spawner)?;
    assert_eq!(spawner.take().iter().filter(|c| c[0] == "cc").count(), 1);
    let compiled = std::fs::read(scanner.object_path("Tool", "main.c"))?;
    assert!(remote
        .lookup(&format!("ck {}", space.path("main.c")))?
        .is_some());

    // A second machine, with nothing local, downloads instead.
    std::fs::remove_file(scanner.object_path("Tool", "main.c"))?;
    let mut second = caching_engine(scanner.clone(), remote.clone());
    build(&mut second, &project, &request(&["Tool"]), &spawner)?;
    assert!(spawner.take().iter().all(|c| c[0] != "cc"));
    assert_eq!(std::fs::read(scanner.object_path("Tool", "main.c"))?, compiled);
    Ok(())
}

#[test]
fn unchanged_rebuild_with_caching_does_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "int main() {}")?;
    let project = space.project(CACHED_TOOL);
    let remote = Arc::new(FakeRemote::default());
    let mut engine = caching_engine(Arc::new(FakeScanner::new(&space)), remote);
    let spawner = FakeSpawner::default();

    build(&mut engine, &project, &request(&["Tool"]), &spawner)?;
    assert!(!spawner.take().is_empty());

    // The compile is now in the local action cache, but it is also up to
    // date, so nothing is replayed and the link stays cached.
    let summary = build(&mut engine, &project, &request(&["Tool"]), &spawner)?;
    let commands = spawner.take();
    assert!(commands.is_empty(), "unchanged rebuild ran {:?}", commands);
    assert_eq!(summary.ran, 0);
    Ok(())
}

#[test]
fn concurrent_materialize_fetches_once() -> anyhow::Result<()> {
    let remote = Arc::new(FakeRemote::default());
    let digest = remote.seed("key", b"object bytes");
    let store = Arc::new(MemoryCas::new());
    let cache = CompilationCache::new(&CacheSetup {
        store: store.clone(),
        remote: Some(remote.clone()),
        budget_bytes: None,
    });
    let output = OutputDescriptor {
        digest,
        kind: "object".into(),
    };

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| cache.materialize(&output, &CancellationToken::new()).unwrap());
        }
    });
    assert_eq!(remote.fetches(), 1);
    assert_eq!(cache.fetch_count(), 1);
    assert_eq!(store.load(&digest)?, b"object bytes");
    Ok(())
}

#[test]
fn cancelled_materialize_is_retried() -> anyhow::Result<()> {
    let remote = Arc::new(FakeRemote::default());
    let digest = remote.seed("key", b"object bytes");
    let cache = CompilationCache::new(&CacheSetup {
        store: Arc::new(MemoryCas::new()),
        remote: Some(remote.clone()),
        budget_bytes: None,
    });
    let output = OutputDescriptor {
        digest,
        kind: "object".into(),
    };

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    assert!(cache.materialize(&output, &cancelled).is_err());
    assert!(cache.materialize(&output, &CancellationToken::new()).is_ok());
    assert_eq!(remote.fetches(), 1);
    Ok(())
}
