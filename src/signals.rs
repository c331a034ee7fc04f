//! External signal sources consulted while processing tasks.
//!
//! The message store, the trust store and the live configuration belong to
//! the host application. Tasks only see them through these traits, and every
//! query may fail transiently.

use crate::clock::Clock;
use crate::error::SignalError;
use crate::task::OwnerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Counts messages authored by an identity.
pub trait MessageSource: Send + Sync {
    /// Number of messages `owner` has written.
    fn count_messages_by(&self, owner: &OwnerId) -> Result<u64, SignalError>;
}

/// Reports how many peers trust an identity.
pub trait TrustSource: Send + Sync {
    /// Number of distinct peers who extended trust to `owner`.
    fn received_trust_count(&self, owner: &OwnerId) -> Result<u32, SignalError>;
}

/// Live configuration values read on every processing cycle.
pub trait ConfigSource: Send + Sync {
    /// Trusters an identity needs before it no longer has to introduce itself.
    fn minimum_truster_count(&self) -> Result<u32, SignalError>;
}

/// Everything a task consults during `process()`.
#[derive(Clone)]
pub struct Collaborators {
    pub messages: Arc<dyn MessageSource>,
    pub trust: Arc<dyn TrustSource>,
    pub config: Arc<dyn ConfigSource>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Per-owner counts in a [`SignalFile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerSignals {
    pub messages: u64,
    pub trusters: u32,
}

/// On-disk layout of a [`SignalFile`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSnapshot {
    pub owners: HashMap<String, OwnerSignals>,
}

/// File-backed message and trust source.
///
/// Re-reads the JSON snapshot on every query so an external exporter can
/// replace it at any time. A missing or malformed file is a transient
/// failure; an owner absent from a readable snapshot has zero counts.
#[derive(Debug, Clone)]
pub struct SignalFile {
    path: PathBuf,
}

impl SignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owners listed in the current snapshot, sorted. Invalid names are skipped.
    pub fn owners(&self) -> Result<Vec<OwnerId>, SignalError> {
        let mut owners: Vec<OwnerId> = self
            .snapshot()?
            .owners
            .into_keys()
            .filter_map(|raw| OwnerId::new(raw).ok())
            .collect();
        owners.sort();
        Ok(owners)
    }

    fn snapshot(&self) -> Result<SignalSnapshot, SignalError> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            SignalError::Unavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            SignalError::Unavailable(format!("cannot parse {}: {e}", self.path.display()))
        })
    }

    fn owner_signals(&self, owner: &OwnerId) -> Result<OwnerSignals, SignalError> {
        Ok(self
            .snapshot()?
            .owners
            .get(owner.as_str())
            .copied()
            .unwrap_or_default())
    }
}

impl MessageSource for SignalFile {
    fn count_messages_by(&self, owner: &OwnerId) -> Result<u64, SignalError> {
        Ok(self.owner_signals(owner)?.messages)
    }
}

impl TrustSource for SignalFile {
    fn received_trust_count(&self, owner: &OwnerId) -> Result<u32, SignalError> {
        Ok(self.owner_signals(owner)?.trusters)
    }
}

/// In-process message and trust source.
///
/// Counts are set by the embedding application (or a test); `set_offline`
/// makes every query fail as if the backing store were unreachable.
#[derive(Debug, Default)]
pub struct InMemorySignals {
    owners: Mutex<HashMap<OwnerId, OwnerSignals>>,
    offline: AtomicBool,
}

impl InMemorySignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the counts reported for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Unavailable`] if the table lock is poisoned.
    pub fn set(&self, owner: &OwnerId, signals: OwnerSignals) -> Result<(), SignalError> {
        self.table()?.insert(owner.clone(), signals);
        Ok(())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn owner_signals(&self, owner: &OwnerId) -> Result<OwnerSignals, SignalError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalError::Unavailable("signal source is offline".to_owned()));
        }
        Ok(self.table()?.get(owner).copied().unwrap_or_default())
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<OwnerId, OwnerSignals>>, SignalError> {
        self.owners
            .lock()
            .map_err(|_| SignalError::Unavailable("signal table lock poisoned".to_owned()))
    }
}

impl MessageSource for InMemorySignals {
    fn count_messages_by(&self, owner: &OwnerId) -> Result<u64, SignalError> {
        Ok(self.owner_signals(owner)?.messages)
    }
}

impl TrustSource for InMemorySignals {
    fn received_trust_count(&self, owner: &OwnerId) -> Result<u32, SignalError> {
        Ok(self.owner_signals(owner)?.trusters)
    }
}
