//! Transfer registry shared by every service and data connection
//!
//! Locking discipline: the registry lock always comes first, records are
//! located only under it, and per-record locks are taken with `try_lock`
//! plus a short sleep on contention. Once a record lock is held the
//! registry lock is released; the record cannot disappear because removal
//! follows the same protocol.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::addr::SockName;
use crate::error::EtdError;
use crate::mode::OpenMode;

/// Back-off between lock attempts when a record is busy.
pub const LOCK_BACKOFF: Duration = Duration::from_micros(25);

/// Opaque transfer handle. Generated fresh per service instance; the wire
/// carries whatever token the peer minted, so this is a token, not a
/// parsed UUID value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferId(String);

impl TransferId {
    pub fn generate() -> Self {
        TransferId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TransferId {
    type Err = EtdError;

    fn from_str(s: &str) -> Result<Self, EtdError> {
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(EtdError::InvalidArgument(format!(
                "'{s}' is not a valid transfer handle"
            )));
        }
        Ok(TransferId(s.to_string()))
    }
}

/// One registered transfer: an open file, the normalized path it was opened
/// at, the mode, and the lock that serializes i/o against removal.
pub struct Transfer {
    pub path: PathBuf,
    pub mode: OpenMode,
    io: Mutex<File>,
}

impl Transfer {
    pub fn new(path: PathBuf, mode: OpenMode, file: File) -> Self {
        Transfer {
            path,
            mode,
            io: Mutex::new(file),
        }
    }
}

#[derive(Default)]
pub struct EtdState {
    pub transfers: HashMap<TransferId, Arc<Transfer>>,
    pub data_addrs: Vec<SockName>,
}

impl EtdState {
    /// Any record registered at this normalized path?
    pub fn path_registered(&self, path: &Path) -> bool {
        self.transfers.values().any(|t| t.path == path)
    }

    /// Any record at this path in a mode other than `Read`? Multiple
    /// readers may share a path; everything else conflicts.
    pub fn path_registered_non_read(&self, path: &Path) -> bool {
        self.transfers
            .values()
            .any(|t| t.path == path && t.mode != OpenMode::Read)
    }
}

#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<EtdState>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry lock. Callers must not hold this across transfer i/o;
    /// registration holds it across its single `open` so that conflict
    /// detection and insertion are one atomic step.
    pub fn lock(&self) -> MutexGuard<'_, EtdState> {
        self.inner.lock()
    }

    pub fn data_addrs(&self) -> Vec<SockName> {
        self.inner.lock().data_addrs.clone()
    }

    pub fn advertise(&self, addr: SockName) {
        self.inner.lock().data_addrs.push(addr);
    }

    /// Run `f` with the record's lock held and the registry lock already
    /// released. Returns `None` when no record exists for `id`. On
    /// contention the registry lock is dropped, the thread sleeps briefly
    /// and the lookup restarts from scratch, because the record may have
    /// been removed in the meantime.
    pub fn with_locked<R>(
        &self,
        id: &TransferId,
        f: impl FnOnce(&Transfer, &mut File) -> R,
    ) -> Option<R> {
        loop {
            let state = self.inner.lock();
            let record = state.transfers.get(id)?.clone();
            match record.io.try_lock() {
                Some(mut file) => {
                    drop(state);
                    return Some(f(&record, &mut *file));
                }
                None => {
                    drop(state);
                    trace!("transfer {id} busy, backing off");
                    std::thread::sleep(LOCK_BACKOFF);
                }
            };
        }
    }

    /// Remove a record, closing its file. Serializes against in-flight
    /// transfers: returns only once the record's lock could be taken, so a
    /// concurrent push/pull finishes first. `false` when nothing is
    /// registered under `id`.
    pub fn remove(&self, id: &TransferId) -> bool {
        loop {
            let mut state = self.inner.lock();
            let record = match state.transfers.get(id) {
                Some(r) => r.clone(),
                None => return false,
            };
            let try_result = record.io.try_lock();
            match try_result {
                Some(file) => {
                    state.transfers.remove(id);
                    drop(state);
                    drop(file);
                    // last handle: dropping the record closes the fd
                    trace!("removed transfer {id}");
                    return true;
                }
                None => {
                    drop(state);
                    std::thread::sleep(LOCK_BACKOFF);
                }
            };
        }
    }
}
