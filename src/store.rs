//! Durable history store. One worker thread owns the cache, the pending
//! queue and the backing file; everything else talks to it over a command
//! channel, so operations execute one at a time in submission order.
//!
//! Writes are coalesced: each append (re)arms a quiet-interval deadline and
//! the whole pending queue is flushed in a single atomic file replace when
//! the deadline fires.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::record::UsageRecord;

enum StoreCmd {
    Append(UsageRecord),
    LoadAll(Sender<Vec<UsageRecord>>),
    ClearAll(Sender<()>),
    SubscribeFlushes(Sender<usize>),
}

/// Handle to the store worker. Cheap to clone; the worker exits (after a
/// final flush of anything still pending) once every handle is dropped.
#[derive(Clone)]
pub struct HistoryStore {
    tx: Sender<StoreCmd>,
}

impl HistoryStore {
    /// Opens the store over `path`, creating parent directories as needed,
    /// and spawns the worker thread. The file itself is created lazily on
    /// first flush; a missing file reads as empty history.
    pub fn open(path: impl Into<PathBuf>, flush_delay: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create history dir {}", parent.display()))?;
        }
        let (tx, rx) = unbounded();
        let mut worker = StoreWorker {
            path,
            flush_delay,
            cached: None,
            pending: Vec::new(),
            flush_subscribers: Vec::new(),
        };
        let _worker = thread::Builder::new()
            .name("history-store".into())
            .spawn(move || worker.run(rx))
            .context("failed to spawn history store thread")?;
        Ok(Self { tx })
    }

    /// Queues a record for persistence. Returns immediately; the record is
    /// visible to `load_all` at once and written to disk after the quiet
    /// interval. Never reports failure to the caller.
    pub fn append(&self, record: UsageRecord) {
        if self.tx.send(StoreCmd::Append(record)).is_err() {
            warn!("history store is gone; dropping record");
        }
    }

    /// Snapshot of persisted plus pending records, persisted first. Pending
    /// order is append order; cross-set ordering is not chronological, so
    /// callers wanting time order sort explicitly.
    pub fn load_all(&self) -> Vec<UsageRecord> {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(StoreCmd::LoadAll(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.recv().unwrap_or_default()
    }

    /// Drops every record, pending and persisted, and immediately writes the
    /// empty set. Returns once the clear has been applied.
    pub fn clear_all(&self) {
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(StoreCmd::ClearAll(reply_tx)).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Channel of completed flushes, carrying the number of records each one
    /// wrote. Tests wait on this instead of sleeping through the debounce.
    pub fn subscribe_flushes(&self) -> Receiver<usize> {
        let (tx, rx) = unbounded();
        let _ = self.tx.send(StoreCmd::SubscribeFlushes(tx));
        rx
    }
}

struct StoreWorker {
    path: PathBuf,
    flush_delay: Duration,
    cached: Option<Vec<UsageRecord>>,
    pending: Vec<UsageRecord>,
    flush_subscribers: Vec<Sender<usize>>,
}

impl StoreWorker {
    fn run(&mut self, rx: Receiver<StoreCmd>) {
        let mut deadline: Option<Instant> = None;
        loop {
            let cmd = match deadline {
                Some(at) => match rx.recv_deadline(at) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        deadline = None;
                        self.flush();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            match cmd {
                StoreCmd::Append(record) => {
                    self.pending.push(record);
                    // Each append cancels the previous schedule.
                    deadline = Some(Instant::now() + self.flush_delay);
                }
                StoreCmd::LoadAll(reply) => {
                    let mut all = self.load_persisted().to_vec();
                    all.extend(self.pending.iter().cloned());
                    let _ = reply.send(all);
                }
                StoreCmd::ClearAll(reply) => {
                    deadline = None;
                    self.pending.clear();
                    self.cached = Some(Vec::new());
                    if let Err(err) = write_atomic(&self.path, &[]) {
                        warn!(path = %self.path.display(), %err, "failed to persist cleared history");
                    }
                    let _ = reply.send(());
                }
                StoreCmd::SubscribeFlushes(tx) => {
                    self.flush_subscribers.push(tx);
                }
            }
        }
        // All handles dropped: drain whatever is still pending.
        self.flush();
    }

    /// Cached view of the persisted set, read from disk at most once until a
    /// flush or clear replaces it.
    fn load_persisted(&mut self) -> &[UsageRecord] {
        if self.cached.is_none() {
            self.cached = Some(read_records(&self.path));
        }
        self.cached.as_deref().unwrap_or_default()
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        // Re-read the authoritative file rather than trusting the cache, so
        // external edits between flushes are not clobbered.
        let mut all = read_records(&self.path);
        all.extend(self.pending.iter().cloned());
        match write_atomic(&self.path, &all) {
            Ok(()) => {
                let written = self.pending.len();
                debug!(written, total = all.len(), "flushed history");
                self.pending.clear();
                self.cached = Some(all);
                self.flush_subscribers.retain(|tx| tx.send(written).is_ok());
            }
            Err(err) => {
                // Pending stays queued; the next append reschedules a flush.
                warn!(path = %self.path.display(), %err, "history flush failed; keeping records pending");
            }
        }
    }
}

/// Reads the record file. Missing or unparsable content is an empty history,
/// never an error surfaced to callers.
fn read_records(path: &Path) -> Vec<UsageRecord> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read history file; treating as empty");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(err) => {
            warn!(path = %path.display(), %err, "history file unparsable; treating as empty");
            Vec::new()
        }
    }
}

/// Write-to-temp-then-rename so the record file is replaced atomically and
/// readers never observe a partial write.
fn write_atomic(path: &Path, records: &[UsageRecord]) -> Result<()> {
    let payload = serde_json::to_vec(records).context("failed to serialize history")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
