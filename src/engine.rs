//! The engine ties one session together: the description cache, the dynamic
//! task coordinator and the build database, reused across builds.

use crate::cancel::CancellationToken;
use crate::cas::CacheSetup;
use crate::config::EngineConfig;
use crate::coordinator::{CompletionToken, DynamicTaskContext};
use crate::db::Db;
use crate::description::{BuildDescription, DescriptionBuilder};
use crate::description_cache::{CacheStatus, DescriptionCache};
use crate::error::DescriptionError;
use crate::fs::FileSystem;
use crate::module_graph::DependencyScanner;
use crate::process::Spawner;
use crate::producer::ProducerRegistry;
use crate::project::{BuildRequest, Project};
use crate::verify::DependencyVerifier;
use crate::work::{self, BuildEnv, BuildSummary, FailedTask, Work};
use std::path::Path;
use std::sync::Arc;

pub struct Engine {
    config: EngineConfig,
    descriptions: DescriptionCache,
    coordinator: DynamicTaskContext,
    verifier: DependencyVerifier,
    db: Db,
    /// Left by the previous build; the next one resets with it.
    pending_reset: Option<CompletionToken>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        scanner: Arc<dyn DependencyScanner>,
        registry: ProducerRegistry,
    ) -> anyhow::Result<Engine> {
        let db = if config.db_path.is_empty() {
            Db::in_memory()
        } else {
            Db::open(Path::new(&config.db_path))?
        };
        // A broken cache only costs speed.
        let cache = match CacheSetup::from_config(&config.cache) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!("compilation cache disabled: {}", err);
                None
            }
        };
        Ok(Engine::with_parts(config, scanner, registry, cache, db))
    }

    /// An engine over an explicit cache and database.
    pub fn with_parts(
        config: EngineConfig,
        scanner: Arc<dyn DependencyScanner>,
        registry: ProducerRegistry,
        cache: Option<CacheSetup>,
        db: Db,
    ) -> Engine {
        let builder = DescriptionBuilder::new(Arc::new(registry), config.producer_parallelism);
        Engine {
            descriptions: DescriptionCache::new(builder, config.description_cache_capacity),
            coordinator: DynamicTaskContext::new(scanner, cache),
            verifier: DependencyVerifier::new(config.verification.inherent_dependencies.as_slice()),
            db,
            pending_reset: None,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn descriptions(&self) -> &DescriptionCache {
        &self.descriptions
    }

    pub fn coordinator(&self) -> &DynamicTaskContext {
        &self.coordinator
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Plans a request without running it.  The description stays retained
    /// until `release`.
    pub fn describe(
        &self,
        project: &Project,
        request: &BuildRequest,
    ) -> Result<(Arc<BuildDescription>, CacheStatus), DescriptionError> {
        self.descriptions.get_or_build(project, request)
    }

    pub fn release(&self, description: &BuildDescription) {
        self.descriptions.release(&description.signature);
    }

    /// Plans and runs a request.  A description with errors is not run; its
    /// diagnostics come back in the summary.
    pub fn build(
        &mut self,
        project: &Project,
        request: &BuildRequest,
        spawner: &dyn Spawner,
        fs: &dyn FileSystem,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BuildSummary> {
        if let Some(token) = self.pending_reset.take() {
            self.coordinator.reset(token)?;
        }

        let (description, status) = self.descriptions.get_or_build(project, request)?;
        tracing::info!(?status, tasks = description.graph.task_count(), "planned");
        if description.has_errors() {
            self.descriptions.release(&description.signature);
            return Ok(BuildSummary {
                diagnostics: description.diagnostics.clone(),
                failed: vec![FailedTask {
                    name: "planning".to_string(),
                    output: Vec::new(),
                }],
                ..Default::default()
            });
        }

        let systems = self.coordinator.systems();
        for (module, target) in &description.module_definitions {
            systems.register_defining_target(module, target);
        }

        let env = BuildEnv {
            spawner,
            fs,
            db: &self.db,
            verifier: &self.verifier,
            cancel,
        };
        let options = work::Options {
            parallelism: self.config.parallelism,
            keep_going: self.config.keep_going,
        };
        let result = Work::new(&description, &self.coordinator, env, options).run();

        // Drain dynamic work and background uploads even after a failure, so
        // the next build can reset.
        self.pending_reset = Some(self.coordinator.wait_for_completion());
        self.descriptions.release(&description.signature);
        let mut summary = result?;
        summary.diagnostics.splice(0..0, description.diagnostics.iter().cloned());
        if let Err(err) = self.db.save() {
            tracing::warn!("saving build database: {}", err);
        }
        Ok(summary)
    }
}
