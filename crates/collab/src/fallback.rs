//! Snapshot-only reconciliation
//!
//! Used when nothing delivers per-keystroke operations: the latest full
//! snapshot is compared with the last one accepted. A clean buffer follows the
//! remote silently; a buffer with unsaved edits raises a conflict the user
//! resolves.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Snapshot, UserId};

/// Remote content that collided with unsaved local edits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// The remote snapshot, verbatim
    pub remote: Snapshot,
    /// Who last changed it, when known
    pub author: Option<UserId>,
}

/// Outcome of comparing a fetched snapshot with the baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Same content as the baseline
    Unchanged,
    /// Local buffer was clean; remote content adopted
    Adopted(Snapshot),
    /// Local buffer has unsaved edits; conflict raised
    Conflict(Conflict),
}

/// Baseline tracking and conflict state for the snapshot path
#[derive(Debug, Clone)]
pub struct FallbackSynchronizer {
    baseline: Snapshot,
    conflict: Option<Conflict>,
}

impl FallbackSynchronizer {
    pub fn new(baseline: Snapshot) -> Self {
        Self {
            baseline,
            conflict: None,
        }
    }

    /// Last snapshot accepted as authoritative
    pub fn baseline(&self) -> &Snapshot {
        &self.baseline
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        self.conflict.as_ref()
    }

    /// Compare `snapshot` with the baseline. `dirty` says whether the local
    /// buffer holds edits made since the baseline.
    pub fn observe(&mut self, snapshot: Snapshot, author: Option<UserId>, dirty: bool) -> PollOutcome {
        if snapshot.content == self.baseline.content {
            if snapshot.version > self.baseline.version {
                self.baseline.version = snapshot.version;
            }
            return PollOutcome::Unchanged;
        }

        if !dirty {
            debug!(version = snapshot.version, "adopting remote snapshot");
            self.baseline = snapshot.clone();
            self.conflict = None;
            return PollOutcome::Adopted(snapshot);
        }

        if self.conflict.as_ref().is_some_and(|c| c.remote.content == snapshot.content) {
            return PollOutcome::Unchanged;
        }

        info!(version = snapshot.version, author = ?author, "remote snapshot conflicts with unsaved edits");
        let conflict = Conflict { remote: snapshot, author };
        self.conflict = Some(conflict.clone());
        PollOutcome::Conflict(conflict)
    }

    /// Resolve by taking the remote content. Returns the snapshot to adopt.
    pub fn accept_remote(&mut self) -> Option<Snapshot> {
        let conflict = self.conflict.take()?;
        self.baseline = conflict.remote.clone();
        Some(conflict.remote)
    }

    /// Resolve by keeping local edits. The remote snapshot becomes the
    /// baseline so it isn't raised again; the next save overwrites it.
    pub fn ignore_remote(&mut self) -> bool {
        match self.conflict.take() {
            Some(conflict) => {
                self.baseline = conflict.remote;
                true
            }
            None => false,
        }
    }

    /// Take `snapshot` as the baseline outright
    pub fn reset(&mut self, snapshot: Snapshot) {
        self.baseline = snapshot;
        self.conflict = None;
    }

    /// Local content reached the store
    pub fn mark_saved(&mut self, content: &str, version: Option<u64>) {
        self.baseline.content = content.to_string();
        if let Some(version) = version {
            self.baseline.version = self.baseline.version.max(version);
        }
        self.conflict = None;
    }
}
