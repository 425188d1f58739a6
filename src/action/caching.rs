//! Dynamic tasks that bring a compilation's cached outputs to this machine.

use super::{ActionContext, CommandResult, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::cas::{CachedCompilation, OutputDescriptor};
use crate::coordinator::{DynamicTaskKey, Priority};
use crate::error::CacheError;

/// Progress of a materialize-key task.  Every transition is driven by
/// `setup` or a dependency notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeState {
    Initial,
    WaitingForKeyQuery,
    WaitingForOutputDownloads,
    Done,
    ExecutionError(String),
}

/// Looks a compilation key up locally, then remotely on a miss, and
/// downloads whatever outputs of a hit are not yet local.  A miss or a
/// failed download is not an error: it reports no cache hit and the
/// compilation runs normally.
pub struct MaterializeKeyAction {
    cache_key: String,
    state: MaterializeState,
    history: Vec<MaterializeState>,
    pending_downloads: usize,
    failed_downloads: usize,
    hit: bool,
}

impl MaterializeKeyAction {
    pub fn new(cache_key: String) -> Self {
        MaterializeKeyAction {
            cache_key,
            state: MaterializeState::Initial,
            history: vec![MaterializeState::Initial],
            pending_downloads: 0,
            failed_downloads: 0,
            hit: false,
        }
    }

    pub fn state(&self) -> &MaterializeState {
        &self.state
    }

    /// Every state entered so far, starting with `Initial`.
    pub fn history(&self) -> &[MaterializeState] {
        &self.history
    }

    fn transition(&mut self, state: MaterializeState) {
        self.history.push(state.clone());
        self.state = state;
    }

    fn local_query(&self, cx: &ActionContext) -> Option<CachedCompilation> {
        let cache = cx.systems().cache.as_ref()?;
        match cache.query_local_cache_key(&self.cache_key) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("compilation cache: {}", err);
                None
            }
        }
    }

    /// Requests a download for each output that is not local yet.
    fn request_outputs(&mut self, entry: &CachedCompilation, cx: &mut ActionContext) {
        self.hit = true;
        for output in entry.unmaterialized() {
            cx.request(DynamicTaskKey::OutputMaterialize(output.clone()), Priority::High);
            self.pending_downloads += 1;
        }
        if self.pending_downloads > 0 {
            self.transition(MaterializeState::WaitingForOutputDownloads);
        } else {
            self.transition(MaterializeState::Done);
        }
    }
}

impl TaskAction for MaterializeKeyAction {
    fn setup(&mut self, cx: &mut ActionContext) {
        if self.state != MaterializeState::Initial {
            self.transition(MaterializeState::ExecutionError(format!(
                "setup in state {:?}",
                self.state
            )));
            return;
        }
        if cx.systems().cache.is_none() {
            self.transition(MaterializeState::ExecutionError(
                "compilation caching is not enabled".into(),
            ));
            return;
        }
        match self.local_query(cx) {
            Some(entry) => self.request_outputs(&entry, cx),
            None => {
                cx.request(
                    DynamicTaskKey::KeyQuery {
                        cache_key: self.cache_key.clone(),
                    },
                    Priority::High,
                );
                self.transition(MaterializeState::WaitingForKeyQuery);
            }
        }
    }

    fn dependency_ready(&mut self, key: &DynamicTaskKey, status: DynamicStatus, cx: &mut ActionContext) {
        match (&self.state, key) {
            (MaterializeState::WaitingForKeyQuery, DynamicTaskKey::KeyQuery { .. }) => {
                // The query has copied any remote hit into the local cache.
                match self.local_query(cx) {
                    Some(entry) => self.request_outputs(&entry, cx),
                    None => self.transition(MaterializeState::Done),
                }
            }
            (
                MaterializeState::WaitingForOutputDownloads,
                DynamicTaskKey::OutputMaterialize(_),
            ) => {
                self.pending_downloads = self.pending_downloads.saturating_sub(1);
                if !status.succeeded() {
                    self.failed_downloads += 1;
                }
                if self.pending_downloads == 0 {
                    self.transition(MaterializeState::Done);
                }
            }
            (MaterializeState::ExecutionError(_), _) => {}
            (state, key) => {
                let message = format!("unexpected notification for {} in state {:?}", key, state);
                self.transition(MaterializeState::ExecutionError(message));
            }
        }
    }

    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        match &self.state {
            MaterializeState::Done => TaskOutcome {
                cache_hit: self.hit && self.failed_downloads == 0,
                ..TaskOutcome::succeeded(false)
            },
            MaterializeState::ExecutionError(message) => TaskOutcome::failed(format!(
                "materializing {}: {}",
                self.cache_key, message
            )),
            state => TaskOutcome::failed(format!(
                "materializing {}: still in state {:?}",
                self.cache_key, state
            )),
        }
    }
}

/// Asks the remote cache about a key.  Never fails: an unreachable remote is
/// a miss.
pub struct KeyQueryAction {
    cache_key: String,
}

impl KeyQueryAction {
    pub fn new(cache_key: String) -> Self {
        KeyQueryAction { cache_key }
    }
}

impl TaskAction for KeyQueryAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        let Some(cache) = &cx.systems.cache else {
            return TaskOutcome::succeeded(false);
        };
        match cache.query_remote_cache_key(&self.cache_key, cx.cancel) {
            Ok(found) => TaskOutcome {
                cache_hit: found.is_some(),
                ..TaskOutcome::succeeded(false)
            },
            Err(CacheError::Cancelled) => TaskOutcome::cancelled(),
            Err(err) => {
                tracing::warn!("remote cache query for {}: {}", self.cache_key, err);
                TaskOutcome::succeeded(false)
            }
        }
    }
}

/// Downloads one output.
pub struct OutputMaterializeAction {
    output: OutputDescriptor,
}

impl OutputMaterializeAction {
    pub fn new(output: OutputDescriptor) -> Self {
        OutputMaterializeAction { output }
    }
}

impl TaskAction for OutputMaterializeAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        let Some(cache) = &cx.systems.cache else {
            return TaskOutcome::failed("compilation caching is not enabled");
        };
        match cache.materialize(&self.output, cx.cancel) {
            Ok(()) => TaskOutcome::succeeded(true),
            Err(_) if cx.cancel.is_cancelled() => TaskOutcome::cancelled(),
            Err(err) => {
                tracing::warn!("downloading {} {}: {}", self.output.kind, self.output.digest, err);
                TaskOutcome {
                    result: CommandResult::Failed,
                    ..TaskOutcome::succeeded(false)
                }
            }
        }
    }
}
