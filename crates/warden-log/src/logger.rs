//! Connection Logger
//!
//! Every decision the pipeline renders lands here exactly once. The
//! on-disk format is JSON Lines; retention of the file is an external
//! concern. The writer thread flushes after each drained batch, so a
//! clean shutdown guarantees at-least-once durability.

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_policy::{AppId, Destination};
use warden_threat::ThreatMatch;
use xxhash_rust::xxh3::xxh3_64;

/// Logger errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal or lobby decision for one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Lobby,
    Block,
}

impl Decision {
    /// LOBBY is a holding state; ALLOW and BLOCK end a flow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Allow | Self::Block)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "ALLOW"),
            Self::Lobby => write!(f, "LOBBY"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLogEntry {
    pub flow_id: String,
    pub app_id: AppId,
    pub destination: Destination,
    pub decision: Decision,
    /// Trigger codes that led to the decision, in evaluation order
    #[serde(default)]
    pub reason: Vec<String>,
    #[serde(default)]
    pub threat_match: Option<ThreatMatch>,
    /// Unix ms
    pub decided_at: u64,
}

/// Filter for `ConnectionLogger::query`.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub app_id: Option<AppId>,
    /// Unix ms, inclusive lower bound
    pub since_ms: Option<u64>,
    /// 0 means "no explicit limit" (the ring bounds it anyway)
    pub limit: usize,
}

impl LogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app(mut self, app_id: AppId) -> Self {
        self.app_id = Some(app_id);
        self
    }

    pub fn since(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Current time as unix milliseconds.
pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum WriterCmd {
    Entry(Box<ConnectionLogEntry>),
    Shutdown(Sender<()>),
}

/// Shared in-memory view: recent entries plus the first-contact set.
struct LogState {
    ring: RwLock<VecDeque<ConnectionLogEntry>>,
    allowed_pairs: RwLock<HashSet<u64>>,
    capacity: usize,
}

impl LogState {
    fn apply(&self, entry: &ConnectionLogEntry) {
        if entry.decision == Decision::Allow {
            let mut pairs = self
                .allowed_pairs
                .write()
                .unwrap_or_else(|e| e.into_inner());
            pairs.insert(pair_key(&entry.app_id, &entry.destination));
        }

        let mut ring = self.ring.write().unwrap_or_else(|e| e.into_inner());
        if ring.len() >= self.capacity {
            ring.pop_back();
        }
        ring.push_front(entry.clone());
    }
}

/// Append-only decision log with a non-blocking record path.
pub struct ConnectionLogger {
    tx: Option<Sender<WriterCmd>>,
    state: Arc<LogState>,
    writer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnectionLogger {
    /// Open (or create) the log file at `path` and start the writer
    /// thread. `ring_capacity` bounds the in-memory query window.
    pub fn open<P: AsRef<Path>>(path: P, ring_capacity: usize) -> Result<Self, LogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        let (tx, rx) = unbounded();
        let handle = spawn_writer(file, rx);

        info!(
            "Connection log open at {} (ring capacity {})",
            path.as_ref().display(),
            ring_capacity
        );

        Ok(Self {
            tx: Some(tx),
            state: Arc::new(LogState {
                ring: RwLock::new(VecDeque::with_capacity(ring_capacity)),
                allowed_pairs: RwLock::new(HashSet::new()),
                capacity: ring_capacity.max(1),
            }),
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Logger without a backing file. Entries live only in the ring;
    /// used by embedders that persist elsewhere, and by tests.
    pub fn in_memory(ring_capacity: usize) -> Self {
        Self {
            tx: None,
            state: Arc::new(LogState {
                ring: RwLock::new(VecDeque::with_capacity(ring_capacity)),
                allowed_pairs: RwLock::new(HashSet::new()),
                capacity: ring_capacity.max(1),
            }),
            writer: Mutex::new(None),
        }
    }

    /// Record one decision. Never blocks on I/O.
    pub fn record(&self, entry: ConnectionLogEntry) {
        self.state.apply(&entry);

        if let Some(tx) = &self.tx {
            if tx.send(WriterCmd::Entry(Box::new(entry))).is_err() {
                warn!("Connection log writer is gone, entry kept in memory only");
            }
        }
    }

    /// Newest-first slice of the recent decision history.
    pub fn query(&self, query: &LogQuery) -> Vec<ConnectionLogEntry> {
        let ring = self.state.ring.read().unwrap_or_else(|e| e.into_inner());
        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit
        };

        ring.iter()
            .filter(|e| match &query.app_id {
                Some(app) => &e.app_id == app,
                None => true,
            })
            .filter(|e| match query.since_ms {
                Some(since) => e.decided_at >= since,
                None => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Has this (app, destination) pair ever been allowed before?
    ///
    /// The lobby's first-contact trigger keys off this.
    pub fn has_allowed(&self, app_id: &AppId, destination: &Destination) -> bool {
        let pairs = self
            .state
            .allowed_pairs
            .read()
            .unwrap_or_else(|e| e.into_inner());
        pairs.contains(&pair_key(app_id, destination))
    }

    /// Replay an existing log file into the in-memory state. Call once
    /// at startup, before the pipeline runs; nothing is re-written.
    pub fn replay<R: Read>(&self, reader: R) -> Result<usize, LogError> {
        let buf_reader = BufReader::new(reader);
        let mut replayed = 0usize;
        let mut skipped = 0usize;

        for line in buf_reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ConnectionLogEntry>(trimmed) {
                Ok(entry) => {
                    self.state.apply(&entry);
                    replayed += 1;
                }
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping malformed log line: {}", e);
                }
            }
        }

        info!(
            "Replayed {} log entries ({} malformed lines skipped)",
            replayed, skipped
        );
        Ok(replayed)
    }

    /// Drain the channel and flush the file. Safe to call more than
    /// once; later calls are no-ops.
    pub fn shutdown(&self) {
        let handle = {
            let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.take()
        };
        let Some(handle) = handle else {
            return;
        };

        if let Some(tx) = &self.tx {
            let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
            if tx.send(WriterCmd::Shutdown(ack_tx)).is_ok() {
                let _ = ack_rx.recv_timeout(Duration::from_secs(5));
            }
        }
        let _ = handle.join();
        info!("Connection log writer stopped");
    }
}

impl Drop for ConnectionLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_writer(file: File, rx: Receiver<WriterCmd>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("connection-log".to_string())
        .spawn(move || {
            debug!("Connection log writer started");
            let mut out = BufWriter::new(file);
            writer_loop(&mut out, &rx);
            debug!("Connection log writer stopped");
        })
        .expect("Failed to spawn connection log writer")
}

fn writer_loop(out: &mut BufWriter<File>, rx: &Receiver<WriterCmd>) {
    while let Ok(cmd) = rx.recv() {
        let mut done = write_cmd(out, cmd);

        // Drain whatever queued up while we were writing, then flush the
        // whole batch in one go
        while done.is_none() {
            match rx.try_recv() {
                Ok(cmd) => done = write_cmd(out, cmd),
                Err(_) => break,
            }
        }

        if let Err(e) = out.flush() {
            warn!("Connection log flush failed: {}", e);
        }

        if let Some(ack) = done {
            let _ = ack.send(());
            return;
        }
    }

    // All senders dropped: flush what we have
    if let Err(e) = out.flush() {
        warn!("Connection log flush failed: {}", e);
    }
}

/// Write one command; returns the ack channel when shutdown was seen.
fn write_cmd(out: &mut BufWriter<File>, cmd: WriterCmd) -> Option<Sender<()>> {
    match cmd {
        WriterCmd::Entry(entry) => {
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    if let Err(e) = writeln!(out, "{}", line) {
                        warn!("Connection log write failed: {}", e);
                    }
                }
                Err(e) => warn!("Connection log serialization failed: {}", e),
            }
            None
        }
        WriterCmd::Shutdown(ack) => Some(ack),
    }
}

fn pair_key(app_id: &AppId, destination: &Destination) -> u64 {
    xxh3_64(format!("{}|{}", app_id, destination).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn entry(app: &str, dest: Destination, decision: Decision, at: u64) -> ConnectionLogEntry {
        ConnectionLogEntry {
            flow_id: Uuid::new_v4().to_string(),
            app_id: AppId::new(app),
            destination: dest,
            decision,
            reason: vec![],
            threat_match: None,
            decided_at: at,
        }
    }

    fn temp_log_path() -> PathBuf {
        std::env::temp_dir().join(format!("warden-log-test-{}.jsonl", Uuid::new_v4()))
    }

    #[test]
    fn test_query_newest_first() {
        let logger = ConnectionLogger::in_memory(16);
        let dest = Destination::domain("example.com", 443);

        logger.record(entry("com.a", dest.clone(), Decision::Allow, 100));
        logger.record(entry("com.b", dest.clone(), Decision::Block, 200));
        logger.record(entry("com.a", dest.clone(), Decision::Block, 300));

        let all = logger.query(&LogQuery::new());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].decided_at, 300);
        assert_eq!(all[2].decided_at, 100);

        let for_a = logger.query(&LogQuery::new().app(AppId::new("com.a")));
        assert_eq!(for_a.len(), 2);

        let recent = logger.query(&LogQuery::new().since(200).limit(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].decided_at, 300);
    }

    #[test]
    fn test_ring_is_bounded() {
        let logger = ConnectionLogger::in_memory(2);
        let dest = Destination::domain("example.com", 443);

        for i in 0..5 {
            logger.record(entry("com.a", dest.clone(), Decision::Block, i));
        }

        let all = logger.query(&LogQuery::new());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].decided_at, 4);
    }

    #[test]
    fn test_has_allowed_tracks_terminal_allows_only() {
        let logger = ConnectionLogger::in_memory(16);
        let dest = Destination::domain("api.example.com", 443);
        let app = AppId::new("com.a");

        assert!(!logger.has_allowed(&app, &dest));

        logger.record(entry("com.a", dest.clone(), Decision::Lobby, 1));
        logger.record(entry("com.a", dest.clone(), Decision::Block, 2));
        assert!(!logger.has_allowed(&app, &dest));

        logger.record(entry("com.a", dest.clone(), Decision::Allow, 3));
        assert!(logger.has_allowed(&app, &dest));

        // Different app, same destination: still first contact
        assert!(!logger.has_allowed(&AppId::new("com.b"), &dest));
    }

    #[test]
    fn test_write_then_replay() {
        let path = temp_log_path();
        let dest = Destination::domain("example.com", 443);

        {
            let logger = ConnectionLogger::open(&path, 16).unwrap();
            logger.record(entry("com.a", dest.clone(), Decision::Allow, 100));
            logger.record(entry("com.a", dest.clone(), Decision::Block, 200));
            logger.shutdown();
        }

        let fresh = ConnectionLogger::in_memory(16);
        let replayed = fresh.replay(fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(replayed, 2);
        assert!(fresh.has_allowed(&AppId::new("com.a"), &dest));
        assert_eq!(fresh.query(&LogQuery::new()).len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let path = temp_log_path();
        let logger = ConnectionLogger::open(&path, 4).unwrap();
        logger.record(entry(
            "com.a",
            Destination::domain("example.com", 443),
            Decision::Allow,
            1,
        ));
        logger.shutdown();
        logger.shutdown();

        let _ = fs::remove_file(&path);
    }
}
