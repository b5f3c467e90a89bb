//! Second phase of the state commit protocol.

use crate::error::CoreResult;
use crate::version::VersionTracker;
use optistore_storage::{EntityReference, StateCommitter, VersionToken};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A staged change batch awaiting its verdict.
///
/// Returned by [`crate::EntityStoreUnitOfWork::complete`] once the
/// backend has durably staged the batch. Nothing is visible to other
/// transactions until [`commit`] returns; [`cancel`] discards the
/// staged writes without a trace. A caller bundling several
/// committers (one per store) can cancel them all if any participant
/// fails.
///
/// After a successful commit the version tracker is told the new
/// token of every written entity and forgets the removed ones.
///
/// [`commit`]: Committer::commit
/// [`cancel`]: Committer::cancel
pub struct Committer {
    inner: Box<dyn StateCommitter>,
    versions: Arc<VersionTracker>,
    remember: Vec<(EntityReference, VersionToken)>,
    forget: Vec<EntityReference>,
}

impl Committer {
    pub(crate) fn new(
        inner: Box<dyn StateCommitter>,
        versions: Arc<VersionTracker>,
        remember: Vec<(EntityReference, VersionToken)>,
        forget: Vec<EntityReference>,
    ) -> Self {
        Self {
            inner,
            versions,
            remember,
            forget,
        }
    }

    /// Returns the number of changes in the staged batch.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.remember.len() + self.forget.len()
    }

    /// Makes the staged batch visible and updates the version tracker.
    ///
    /// # Errors
    ///
    /// Backend commit failures (e.g. a rename race) propagate as
    /// storage errors; no automatic retry happens at this layer.
    pub fn commit(self) -> CoreResult<()> {
        self.inner.commit()?;
        for (reference, token) in &self.remember {
            self.versions.remember(reference, token);
        }
        self.versions.forget(self.forget.iter());
        debug!(
            "committed {} writes, {} removals",
            self.remember.len(),
            self.forget.len()
        );
        Ok(())
    }

    /// Discards the staged batch. Durable state is untouched and the
    /// version tracker is not updated.
    pub fn cancel(self) {
        debug!(
            "cancelled batch of {} staged changes",
            self.change_count()
        );
        self.inner.cancel();
    }
}

impl fmt::Debug for Committer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committer")
            .field("writes", &self.remember.len())
            .field("removals", &self.forget.len())
            .finish_non_exhaustive()
    }
}
