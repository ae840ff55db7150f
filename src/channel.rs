//! Cross-context change notifications.
//!
//! DESIGN
//! ======
//! Every store instance is a context with its own origin id. Contexts post
//! bare tags (`updated`, `cloud-synced`) on a named channel; listeners get
//! an `Envelope` per post and drop the ones they sent themselves. Unknown
//! tags travel through but carry no signal.
//!
//! Two transports sit behind the `Channel` trait and one is picked by
//! configuration:
//! - `MemoryChannel`: a tokio broadcast shared by contexts in one process.
//! - `FileChannel`: a JSON-lines log in the data directory, tailed by a
//!   polling task, shared by every process pointing at that directory.
//!
//! TRADE-OFFS
//! ==========
//! The log is truncated once it grows past `MAX_LOG_BYTES`. A reader that
//! is mid-poll during truncation may miss a tag or read a partial line;
//! partial lines fail to parse and are skipped. Tags are change hints, and
//! the periodic mirror refresh covers anything lost.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Name of the channel shared by every product store context.
pub const CHANNEL_NAME: &str = "truespeed-products";

const LISTENER_CAPACITY: usize = 64;
const MAX_LOG_BYTES: u64 = 64 * 1024;

// =============================================================================
// SIGNALS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The local cache changed.
    Updated,
    /// A mirror push completed.
    CloudSynced,
}

impl Signal {
    #[must_use]
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Updated => "updated",
            Self::CloudSynced => "cloud-synced",
        }
    }

    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "updated" => Some(Self::Updated),
            "cloud-synced" => Some(Self::CloudSynced),
            _ => None,
        }
    }
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Context that posted the message.
    pub origin: Uuid,
    pub tag: String,
}

impl Envelope {
    #[must_use]
    pub fn new(origin: Uuid, signal: Signal) -> Self {
        Self { origin, tag: signal.as_tag().to_owned() }
    }

    /// The known signal carried by this envelope, if any.
    #[must_use]
    pub fn signal(&self) -> Option<Signal> {
        Signal::from_tag(&self.tag)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel log I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("channel message encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// Transport-neutral broadcast between store contexts.
pub trait Channel: Send + Sync {
    /// Deliver `envelope` to every listener.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError`] when the transport cannot accept the message.
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Start receiving envelopes posted from now on.
    fn listen(&self) -> broadcast::Receiver<Envelope>;
}

// =============================================================================
// MEMORY CHANNEL
// =============================================================================

/// In-process transport. Clones share the same underlying channel.
#[derive(Clone)]
pub struct MemoryChannel {
    tx: broadcast::Sender<Envelope>,
}

impl MemoryChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LISTENER_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MemoryChannel {
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        // A send error only means nobody is listening yet.
        if self.tx.send(envelope).is_err() {
            trace!("memory channel post with no listeners");
        }
        Ok(())
    }

    fn listen(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

// =============================================================================
// FILE CHANNEL
// =============================================================================

/// Cross-process transport backed by `<dir>/<name>.bus`.
pub struct FileChannel {
    path: PathBuf,
    poll: Duration,
    tx: broadcast::Sender<Envelope>,
    tailer: Mutex<Option<JoinHandle<()>>>,
}

impl FileChannel {
    /// `poll` below one millisecond is raised to one.
    #[must_use]
    pub fn new(dir: &Path, name: &str, poll: Duration) -> Self {
        let (tx, _) = broadcast::channel(LISTENER_CAPACITY);
        let poll = poll.max(Duration::from_millis(1));
        Self { path: dir.join(format!("{name}.bus")), poll, tx, tailer: Mutex::new(None) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_line(&self, line: &str) -> Result<(), ChannelError> {
        let io_err = |source| ChannelError::Io { path: self.path.clone(), source };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if len > MAX_LOG_BYTES {
            file.set_len(0).map_err(io_err)?;
            debug!(path = %self.path.display(), "channel log truncated");
        }
        file.write_all(format!("{line}\n").as_bytes()).map_err(io_err)
    }

    /// Spawn the polling task on first use. Needs a tokio runtime; without
    /// one the receiver simply never fires.
    fn ensure_tailer(&self) {
        let mut tailer = self
            .tailer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if tailer.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path = %self.path.display(), "no tokio runtime; file channel listener disabled");
            return;
        };

        let start = std::fs::metadata(&self.path).map_or(0, |m| m.len());
        let tail = LogTail { path: self.path.clone(), offset: start };
        *tailer = Some(handle.spawn(run_tailer(tail, self.poll, self.tx.clone())));
    }
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        let tailer = self
            .tailer
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = tailer.take() {
            handle.abort();
        }
    }
}

impl Channel for FileChannel {
    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        let line = serde_json::to_string(&envelope)?;
        self.append_line(&line)
    }

    fn listen(&self) -> broadcast::Receiver<Envelope> {
        let rx = self.tx.subscribe();
        self.ensure_tailer();
        rx
    }
}

/// Read position in the channel log.
struct LogTail {
    path: PathBuf,
    offset: u64,
}

impl LogTail {
    /// Return complete lines appended since the last call.
    fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if len < self.offset {
            // EDGE: log was truncated by a writer; start over.
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        // Only consume up to the last newline; a trailing partial line is
        // picked up on the next poll.
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        self.offset += (last_newline + 1) as u64;

        Ok(String::from_utf8_lossy(&buf[..last_newline])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_owned)
            .collect())
    }
}

async fn run_tailer(mut tail: LogTail, poll: Duration, tx: broadcast::Sender<Envelope>) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let lines = match tail.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                warn!(path = %tail.path.display(), error = %e, "channel log read failed");
                continue;
            }
        };
        for line in lines {
            match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        trace!("file channel message with no listeners");
                    }
                }
                Err(e) => debug!(error = %e, "skipping malformed channel line"),
            }
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
