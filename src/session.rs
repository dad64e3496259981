//! Session registry: a tombstoning arena of per-session records.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cryptoki_sys::CK_SESSION_HANDLE;
use tracing::debug;

use crate::config::Config;
use crate::error::TokenError;

/// Per-session state behind its own lock.
#[derive(Debug)]
pub struct SessionRecord {
    /// Object-enumeration position; `None` while no search is active.
    pub cursor: Option<usize>,
    /// Shared configuration snapshot.
    pub config: Arc<Config>,
}

impl SessionRecord {
    fn new(config: Arc<Config>) -> Self {
        Self { cursor: None, config }
    }
}

/// Arena of session records.
///
/// Handles are 1-based arena indices. Closed slots become tombstones and
/// are never reused, so a stale handle can never alias a newer session.
/// The arena lock covers structure only; record state sits behind the
/// per-record mutex.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    records: RwLock<Vec<Option<Arc<Mutex<SessionRecord>>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and hand out its non-zero handle.
    pub fn open(&self, config: Arc<Config>) -> CK_SESSION_HANDLE {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.push(Some(Arc::new(Mutex::new(SessionRecord::new(config)))));
        let handle = records.len() as CK_SESSION_HANDLE;
        debug!(handle, "session opened");
        handle
    }

    /// Tombstone a session. Unknown and already closed handles are no-ops.
    pub fn close(&self, handle: CK_SESSION_HANDLE) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match Self::index(handle, records.len()) {
            Some(index) if records[index].is_some() => {
                records[index] = None;
                debug!(handle, "session closed");
            }
            _ => debug!(handle, "close of unknown session ignored"),
        }
    }

    /// Look up a live session record.
    pub fn get(&self, handle: CK_SESSION_HANDLE) -> Result<Arc<Mutex<SessionRecord>>, TokenError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Self::index(handle, records.len())
            .and_then(|index| records[index].clone())
            .ok_or(TokenError::SessionInvalid(handle))
    }

    fn index(handle: CK_SESSION_HANDLE, len: usize) -> Option<usize> {
        let index = usize::try_from(handle.checked_sub(1)?).ok()?;
        (index < len).then_some(index)
    }
}
