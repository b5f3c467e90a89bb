//! Version tracking and commit-time conflict detection.

use crate::error::{CoreError, CoreResult};
use optistore_storage::{EntityReference, StorageError, VersionToken};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Tracks the last version token known to be durable per entity.
///
/// Shared process-wide across all in-flight transactions. The table
/// is a bounded LRU; evicting an entry only ever forces a fresh
/// backend probe during the next conflict check, never a false
/// verdict. An entry, while present, is never older than the token
/// the backend would return for that reference.
///
/// All table access runs under one coarse lock with short critical
/// sections; the conflict check performs its backend probes outside
/// the lock (backend calls may block on I/O).
#[derive(Debug)]
pub struct VersionTracker {
    inner: Mutex<Tracked>,
    capacity: usize,
}

#[derive(Debug)]
struct Tracked {
    entries: HashMap<EntityReference, Entry>,
    recency: VecDeque<(EntityReference, u64)>,
    tick: u64,
}

#[derive(Debug)]
struct Entry {
    token: VersionToken,
    stamp: u64,
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl VersionTracker {
    /// Default bound on tracked entries.
    pub const DEFAULT_CAPACITY: usize = 8192;

    /// Creates a tracker bounded to `capacity` entries (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Tracked {
                entries: HashMap::new(),
                recency: VecDeque::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Records the version last known to be durable for `reference`.
    ///
    /// Called after every successful commit for each affected entity.
    pub fn remember(&self, reference: &EntityReference, token: &VersionToken) {
        let mut inner = self.inner.lock();
        inner.insert(reference.clone(), token.clone());
        inner.evict_over(self.capacity);
    }

    /// Evicts the version records for a set of references.
    ///
    /// Called after removals; a later check simply probes the backend.
    pub fn forget<'a>(&self, references: impl IntoIterator<Item = &'a EntityReference>) {
        let mut inner = self.inner.lock();
        for reference in references {
            inner.entries.remove(reference);
        }
    }

    /// Returns the recorded token for `reference`, if any.
    #[must_use]
    pub fn recorded(&self, reference: &EntityReference) -> Option<VersionToken> {
        self.inner
            .lock()
            .entries
            .get(reference)
            .map(|entry| entry.token.clone())
    }

    /// Returns the number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if no versions are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks a change batch for concurrent modification.
    ///
    /// `candidates` holds, for every non-NEW state in the batch, the
    /// version token the transaction captured when it loaded the
    /// entity. References without a tracked record are resolved with
    /// `probe`, a blocking point query for the authoritative current
    /// token, performed outside the tracker's critical section.
    /// A probe reporting `NotFound` counts as a conflict (the entity
    /// was removed concurrently).
    ///
    /// The whole batch is scanned before any verdict: on mismatch the
    /// check fails atomically with the complete set of conflicting
    /// references, so the caller can retry or merge in one round trip.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConcurrentModification`] on any version mismatch;
    /// probe failures other than `NotFound` propagate unchanged.
    pub fn check_conflicts<F>(
        &self,
        candidates: &[(EntityReference, VersionToken)],
        probe: F,
    ) -> CoreResult<()>
    where
        F: Fn(&EntityReference) -> CoreResult<VersionToken>,
    {
        let mut conflicting = Vec::new();
        let mut unrecorded = Vec::new();

        {
            let mut inner = self.inner.lock();
            for (reference, seen) in candidates {
                match inner.get_touch(reference) {
                    Some(recorded) => {
                        if &recorded != seen {
                            conflicting.push(reference.clone());
                        }
                    }
                    None => unrecorded.push((reference.clone(), seen.clone())),
                }
            }
        }

        let mut probed = Vec::new();
        for (reference, seen) in unrecorded {
            match probe(&reference) {
                Ok(current) => {
                    if current != seen {
                        conflicting.push(reference.clone());
                    }
                    probed.push((reference, current));
                }
                Err(CoreError::Storage(StorageError::NotFound { .. })) => {
                    conflicting.push(reference);
                }
                Err(other) => return Err(other),
            }
        }

        if !probed.is_empty() {
            let mut inner = self.inner.lock();
            for (reference, token) in probed {
                // A commit that raced ahead of the probe already holds
                // the newer token; never overwrite it.
                inner.insert_if_absent(reference, token);
            }
            inner.evict_over(self.capacity);
        }

        if conflicting.is_empty() {
            Ok(())
        } else {
            debug!("conflict check failed for {} entities", conflicting.len());
            Err(CoreError::ConcurrentModification {
                references: conflicting,
            })
        }
    }
}

impl Tracked {
    fn insert(&mut self, reference: EntityReference, token: VersionToken) {
        self.tick += 1;
        let stamp = self.tick;
        self.recency.push_back((reference.clone(), stamp));
        self.entries.insert(reference, Entry { token, stamp });
        self.drop_stale_front();
    }

    fn insert_if_absent(&mut self, reference: EntityReference, token: VersionToken) {
        if !self.entries.contains_key(&reference) {
            self.insert(reference, token);
        }
    }

    fn get_touch(&mut self, reference: &EntityReference) -> Option<VersionToken> {
        self.tick += 1;
        let stamp = self.tick;
        let entry = self.entries.get_mut(reference)?;
        entry.stamp = stamp;
        self.recency.push_back((reference.clone(), stamp));
        Some(entry.token.clone())
    }

    /// Evicts least-recently-used entries until at most `capacity`
    /// remain. Recency records whose stamp no longer matches their
    /// entry are stale and skipped.
    fn evict_over(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((reference, stamp)) = self.recency.pop_front() else {
                break;
            };
            if self
                .entries
                .get(&reference)
                .is_some_and(|entry| entry.stamp == stamp)
            {
                self.entries.remove(&reference);
            }
        }
        self.drop_stale_front();
    }

    fn drop_stale_front(&mut self) {
        while let Some((reference, stamp)) = self.recency.front() {
            let stale = self
                .entries
                .get(reference)
                .map_or(true, |entry| entry.stamp != *stamp);
            if stale {
                self.recency.pop_front();
            } else {
                break;
            }
        }
    }
}
