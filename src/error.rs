//! Typed errors for the layers whose failures callers need to tell apart.
//! Everything else travels as `anyhow::Error`.

use crate::diagnostic::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

/// Failure to produce any build description at all.  Graph-level problems
/// such as duplicate outputs are not errors here: they come back as
/// diagnostics on the description.
#[derive(Debug, Error)]
pub enum DescriptionError {
    #[error("unknown target {0:?}")]
    UnknownTarget(String),

    #[error("target {target:?} depends on unknown target {dependency:?}")]
    UnknownDependency { target: String, dependency: String },

    #[error("cycle in target dependencies: {}", .0.join(" -> "))]
    TargetCycle(Vec<String>),

    #[error("no targets requested")]
    EmptyRequest,

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// The failure of a build that other callers joined.
    #[error(transparent)]
    Shared(#[from] Arc<DescriptionError>),
}

impl DescriptionError {
    /// The error itself, looking through any sharing.
    pub fn root(&self) -> &DescriptionError {
        match self {
            DescriptionError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleGraphError {
    #[error("no build planned for {0:?}")]
    NotPlanned(String),

    #[error("failed to look up job {job:?} in build plan {plan_id:?}")]
    JobNotFound { plan_id: String, job: String },

    #[error("failed to look up explicit dependency job {0:?}")]
    ExplicitJobNotFound(String),

    #[error("dependency scan of {plan_id:?} failed")]
    ScanFailed {
        plan_id: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("dependency scan of {0:?} was cancelled")]
    Cancelled(String),
}

/// Errors talking to the local content store or a remote cache.  These are
/// never fatal to a build: callers log them and carry on without the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry {0:?} is corrupt: {1}")]
    Corrupt(String, String),

    #[error("content {0} is not available")]
    MissingContent(String),

    #[error("remote cache: {0}")]
    Remote(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Shared(#[from] Arc<CacheError>),
}

/// A dynamic task key that could not be turned into runnable work.  Only the
/// task that asked for it fails.
#[derive(Debug, Clone, Error)]
pub enum DynamicTaskError {
    #[error(transparent)]
    ModuleGraph(#[from] ModuleGraphError),

    #[error("compilation caching is not enabled for this build")]
    CacheUnavailable,

    #[error("dynamic task context was reset with a token from another generation")]
    StaleToken,
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("reading trace {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing trace {path:?}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
