//! Commit state tracking.

use std::sync::Mutex;

use tracing::debug;

/// States a commit passes through.
///
/// ```text
/// Idle -> ColumnsResolved -> BufferBuilt -> [IndexesDisabled]
///      -> DirectTransferred
///       | StagingCreated -> StagedDataLoaded -> Merged -> IdentitiesReadBack
///         -> StagingDropped -> IdentitiesWritten
///      -> [IndexesRebuilt] -> Done
/// ```
///
/// Any failure or cancellation ends in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle,
    ColumnsResolved,
    BufferBuilt,
    IndexesDisabled,
    DirectTransferred,
    StagingCreated,
    StagedDataLoaded,
    Merged,
    IdentitiesReadBack,
    StagingDropped,
    IdentitiesWritten,
    IndexesRebuilt,
    Done,
    Aborted,
}

/// Caller-owned record of one commit's transitions.
///
/// Pass it to [`commit_async_with_progress`](crate::BulkInsertOperation::commit_async_with_progress)
/// to learn how far a failed commit got, for example whether it left
/// non-clustered indexes disabled.
#[derive(Debug, Default)]
pub struct CommitProgress {
    history: Mutex<Vec<CommitState>>,
}

impl CommitProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest state (`Idle` before the commit starts).
    pub fn state(&self) -> CommitState {
        self.lock().last().copied().unwrap_or(CommitState::Idle)
    }

    /// Every state entered, in order.
    pub fn history(&self) -> Vec<CommitState> {
        self.lock().clone()
    }

    /// Whether the commit disabled indexes and did not rebuild them.
    pub fn indexes_left_disabled(&self) -> bool {
        let history = self.lock();
        history.contains(&CommitState::IndexesDisabled)
            && !history.contains(&CommitState::IndexesRebuilt)
    }

    pub(crate) fn advance(&self, table: &str, next: CommitState) {
        let mut history = self.lock();
        let previous = history.last().copied().unwrap_or(CommitState::Idle);
        debug!("{}: {:?} -> {:?}", table, previous, next);
        history.push(next);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CommitState>> {
        // A panic while pushing cannot leave the vector half-written.
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
