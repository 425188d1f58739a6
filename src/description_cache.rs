//! Build descriptions cached by request signature.
//!
//! An unchanged request gets the previous description back without any
//! producer running.  Concurrent callers with the same new request share one
//! build.  Entries are reference counted by the callers using them and are
//! evicted least recently used first, once released, when the cache is over
//! capacity.  Descriptions with errors are never kept.

use crate::description::{plan_request, BuildDescription, DescriptionBuilder};
use crate::error::DescriptionError;
use crate::hash::Signature;
use crate::memo::Memo;
use crate::project::{BuildRequest, Project};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the cache.
    Hit,
    /// Built by this call.
    Miss,
    /// Built by a concurrent call for the same request.
    Joined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub joined: usize,
}

type BuildResult = Result<Arc<BuildDescription>, Arc<DescriptionError>>;

/// Hands back a build's error, unwrapped when no other caller still holds it.
fn unshare(err: Arc<DescriptionError>) -> DescriptionError {
    Arc::try_unwrap(err).unwrap_or_else(DescriptionError::Shared)
}

struct Entry {
    description: Arc<BuildDescription>,
    /// Callers that have not released this description yet.
    retain: usize,
    last_used: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<Signature, Entry>,
    clock: u64,
    stats: CacheStats,
}

pub struct DescriptionCache {
    builder: DescriptionBuilder,
    capacity: usize,
    state: Mutex<State>,
    /// Builds in flight or cached, keyed like `entries`.
    builds: Memo<Signature, BuildResult>,
}

impl DescriptionCache {
    pub fn new(builder: DescriptionBuilder, capacity: usize) -> Self {
        DescriptionCache {
            builder,
            capacity,
            state: Mutex::default(),
            builds: Memo::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the description for a request, building it on a miss.  The
    /// caller holds a reference until it calls `release` with the
    /// description's signature.
    pub fn get_or_build(
        &self,
        project: &Project,
        request: &BuildRequest,
    ) -> Result<(Arc<BuildDescription>, CacheStatus), DescriptionError> {
        let planned = plan_request(project, request)?;
        let signature = planned.signature;

        {
            let mut state = self.lock();
            state.clock += 1;
            let now = state.clock;
            if let Some(entry) = state.entries.get_mut(&signature) {
                entry.retain += 1;
                entry.last_used = now;
                let description = entry.description.clone();
                state.stats.hits += 1;
                tracing::info!(%signature, "build description cache hit");
                return Ok((description, CacheStatus::Hit));
            }
        }

        let (result, computed) = self.builds.get_or_compute(&signature, || {
            self.builder
                .build_resolved(&planned)
                .map(Arc::new)
                .map_err(Arc::new)
        });

        let description = match result {
            Ok(description) => description,
            Err(err) => {
                if computed {
                    self.builds.forget(&signature);
                }
                return Err(unshare(err));
            }
        };

        let status = if computed {
            CacheStatus::Miss
        } else {
            CacheStatus::Joined
        };
        let mut state = self.lock();
        match status {
            CacheStatus::Miss => state.stats.misses += 1,
            _ => state.stats.joined += 1,
        }
        if description.has_errors() {
            // A failed plan must be rebuilt on retry.
            drop(state);
            if computed {
                self.builds.forget(&signature);
            }
            tracing::info!(%signature, "build description has errors, not caching");
            return Ok((description, status));
        }
        state.clock += 1;
        let now = state.clock;
        let entry = state.entries.entry(signature).or_insert_with(|| Entry {
            description: description.clone(),
            retain: 0,
            last_used: now,
        });
        entry.retain += 1;
        entry.last_used = now;
        tracing::info!(%signature, ?status, "build description cache miss");
        self.evict(&mut state);
        Ok((description, status))
    }

    /// Signals that a caller is done with a description.
    pub fn release(&self, signature: &Signature) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(signature) {
            entry.retain = entry.retain.saturating_sub(1);
        }
        self.evict(&mut state);
    }

    fn evict(&self, state: &mut State) {
        while state.entries.len() > self.capacity {
            let victim = state
                .entries
                .iter()
                .filter(|(_, e)| e.retain == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(sig, _)| *sig);
            let Some(victim) = victim else {
                break;
            };
            state.entries.remove(&victim);
            self.builds.forget(&victim);
            tracing::debug!(signature = %victim, "evicted build description");
        }
    }

    pub fn contains(&self, signature: &Signature) -> bool {
        self.lock().entries.contains_key(signature)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeRef;
    use crate::producer::{ProducerContext, ProducerOutput, ProducerRegistry, TaskProducer};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plans one task per target and counts its calls.
    struct Counting(Arc<AtomicUsize>);

    impl TaskProducer for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            let path = format!("/out/{}", cx.target.name());
            out.push(cx.task(["Stamp", path.as_str()]).output(NodeRef::path(&path)).build());
        }
    }

    /// Claims the same output for every target.
    struct Conflicting;

    impl TaskProducer for Conflicting {
        fn name(&self) -> &'static str {
            "conflicting"
        }

        fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
            out.push(
                cx.task(["Write", cx.target.name()])
                    .output(NodeRef::path("/out/same"))
                    .build(),
            );
        }
    }

    fn project() -> Project {
        serde_json::from_str(
            r#"{"name": "P", "targets": [
                {"name": "A", "product_type": "tool"},
                {"name": "B", "product_type": "tool", "dependencies": ["A"]},
                {"name": "C", "product_type": "tool"}
            ]}"#,
        )
        .unwrap()
    }

    fn request(target: &str) -> BuildRequest {
        BuildRequest {
            targets: vec![target.to_string()],
            ..Default::default()
        }
    }

    fn counting_cache(capacity: usize) -> (DescriptionCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ProducerRegistry::empty().with_target_producer(Counting(calls.clone()));
        let cache = DescriptionCache::new(DescriptionBuilder::new(Arc::new(registry), 2), capacity);
        (cache, calls)
    }

    #[test]
    fn hit_runs_no_producer() {
        let (cache, calls) = counting_cache(4);
        let project = project();
        let (first, status) = cache.get_or_build(&project, &request("B")).unwrap();
        assert_eq!(status, CacheStatus::Miss);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let (second, status) = cache.get_or_build(&project, &request("B")).unwrap();
        assert_eq!(status, CacheStatus::Hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                joined: 0
            }
        );
    }

    #[test]
    fn concurrent_requests_share_one_build() {
        let (cache, calls) = counting_cache(4);
        let project = project();
        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| cache.get_or_build(&project, &request("C")).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let misses = results
            .iter()
            .filter(|(_, status)| *status == CacheStatus::Miss)
            .count();
        assert_eq!(misses, 1);
        for (desc, _) in &results {
            assert!(Arc::ptr_eq(desc, &results[0].0));
        }
    }

    #[test]
    fn evicts_least_recently_used_released() {
        let (cache, _) = counting_cache(1);
        let project = project();
        let (a, _) = cache.get_or_build(&project, &request("A")).unwrap();
        let (c, _) = cache.get_or_build(&project, &request("C")).unwrap();
        // Both still held.
        assert_eq!(cache.len(), 2);

        cache.release(&a.signature);
        assert!(!cache.contains(&a.signature));
        assert!(cache.contains(&c.signature));
    }

    #[test]
    fn failed_descriptions_are_not_cached() {
        let registry = ProducerRegistry::empty().with_target_producer(Conflicting);
        let cache = DescriptionCache::new(DescriptionBuilder::new(Arc::new(registry), 1), 4);
        let project = project();
        let (desc, status) = cache.get_or_build(&project, &request("B")).unwrap();
        assert!(desc.has_errors());
        assert_eq!(status, CacheStatus::Miss);
        assert!(cache.is_empty());
        let (_, status) = cache.get_or_build(&project, &request("B")).unwrap();
        assert_eq!(status, CacheStatus::Miss);
    }

    #[test]
    fn shared_errors_keep_their_variant() {
        let err = Arc::new(DescriptionError::UnknownDependency {
            target: "B".into(),
            dependency: "Gone".into(),
        });
        let joined = err.clone();
        let err = unshare(err);
        assert!(matches!(err, DescriptionError::Shared(_)));
        assert!(matches!(
            err.root(),
            DescriptionError::UnknownDependency { dependency, .. } if dependency == "Gone"
        ));
        assert_eq!(err.to_string(), joined.to_string());

        drop(err);
        assert!(matches!(unshare(joined), DescriptionError::UnknownDependency { .. }));
    }

    #[test]
    fn planning_errors_pass_through() {
        let (cache, calls) = counting_cache(4);
        let err = cache.get_or_build(&project(), &request("Z")).unwrap_err();
        assert!(matches!(err, DescriptionError::UnknownTarget(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
