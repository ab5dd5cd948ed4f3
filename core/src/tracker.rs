use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::monitor::{Signal, SignalSender};

/// Persisted "unsynced changes exist" flag shared by every process using the
/// same data directory. The stored stamp identifies the last writer.
pub trait DirtyMarker: Send + Sync {
    fn set(&self, stamp: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn read(&self) -> Result<Option<String>>;
}

pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DirtyMarker for FileMarker {
    fn set(&self, stamp: &str) -> Result<()> {
        fs::write(&self.path, stamp)
            .with_context(|| format!("Failed to write marker: {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove marker: {}", self.path.display())),
        }
    }

    fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read marker: {}", self.path.display()))
            }
        }
    }
}

impl<T: DirtyMarker + ?Sized> DirtyMarker for Arc<T> {
    fn set(&self, stamp: &str) -> Result<()> {
        (**self).set(stamp)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn read(&self) -> Result<Option<String>> {
        (**self).read()
    }
}

#[derive(Default)]
pub struct MemoryMarker {
    value: Mutex<Option<String>>,
}

impl DirtyMarker for MemoryMarker {
    fn set(&self, stamp: &str) -> Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(stamp.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn read(&self) -> Result<Option<String>> {
        Ok(self
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Counts local mutations not yet confirmed by a sync pass and keeps the
/// dirty marker in step with that count.
#[derive(Clone)]
pub struct ChangeTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    pending: AtomicU64,
    marker: Box<dyn DirtyMarker>,
    instance: String,
    seq: AtomicU64,
    signals: SignalSender,
    last_seen: Mutex<Option<String>>,
}

impl ChangeTracker {
    /// A marker left behind by an earlier run counts as one pending change.
    pub fn new(marker: Box<dyn DirtyMarker>, signals: SignalSender) -> Self {
        let existing = marker.read().unwrap_or_else(|e| {
            warn!(error = %e, "could not read dirty marker");
            None
        });
        let pending = u64::from(existing.is_some());
        Self {
            inner: Arc::new(TrackerInner {
                pending: AtomicU64::new(pending),
                marker,
                instance: Uuid::new_v4().to_string(),
                seq: AtomicU64::new(0),
                signals,
                last_seen: Mutex::new(existing),
            }),
        }
    }

    pub fn in_memory(signals: SignalSender) -> Self {
        Self::new(Box::new(MemoryMarker::default()), signals)
    }

    pub fn pending(&self) -> u64 {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn remember(&self, stamp: Option<String>) {
        *self
            .inner
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = stamp;
    }

    fn write_marker(&self) {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let stamp = format!("{}:{seq}", self.inner.instance);
        if let Err(e) = self.inner.marker.set(&stamp) {
            warn!(error = %e, "could not persist dirty marker");
        }
        self.remember(Some(stamp));
    }

    /// Record one local mutation.
    pub fn mark(&self) {
        let pending = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.write_marker();
        debug!(pending, "local change marked");
        self.inner.signals.send(Signal::ChangesMarked);
    }

    /// Account for `synced` changes confirmed by a successful pass. The
    /// marker is cleared only when nothing arrived in the meantime, from this
    /// process or another one.
    pub fn settle(&self, synced: u64) -> u64 {
        let remaining = match self.inner.pending.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |p| Some(p.saturating_sub(synced)),
        ) {
            Ok(previous) | Err(previous) => previous.saturating_sub(synced),
        };
        if remaining == 0 {
            if self.foreign_change() {
                self.note_external();
                return self.pending();
            }
            if let Err(e) = self.inner.marker.clear() {
                warn!(error = %e, "could not clear dirty marker");
            }
            self.remember(None);
            // a mark() racing with the clear above must not lose its marker
            if self.pending() > 0 {
                self.write_marker();
            }
        }
        remaining
    }

    /// True when another process rewrote the marker since we last looked.
    pub fn foreign_change(&self) -> bool {
        let current = match self.inner.marker.read() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "could not read dirty marker");
                return false;
            }
        };
        let mut last_seen = self
            .inner
            .last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if current == *last_seen {
            return false;
        }
        let foreign = current
            .as_deref()
            .is_some_and(|stamp| !stamp.starts_with(self.inner.instance.as_str()));
        last_seen.clone_from(&current);
        foreign
    }

    /// Treat a change made elsewhere as a local pending change.
    pub fn note_external(&self) {
        let pending = self.inner.pending.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(pending, "change observed from another process");
        self.inner.signals.send(Signal::ChangesMarked);
    }
}
