//! Dual-sink logging plus an in-process log/telemetry broadcast fan-out.
//!
//! `init()` installs one global logger backed by `env_logger`'s formatter,
//! writing to stderr, or to the systemd journal when one is detected (we
//! try the journal first and fall back to env_logger, matching the startup
//! order a systemd unit's `journalctl` integration expects). A second,
//! independent piece - the [`LogBufHandle`] - receives every formatted line
//! over an `mpsc` channel and republishes it on named `broadcast` channels,
//! so an HTTP layer can `subscribe()` to `app_logs`, a given dryer's log
//! channel, or the `dryers_stats` telemetry channel without this crate
//! needing to know anything about WebSockets.

use log::LevelFilter;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::rc::Rc;
use tokio::sync::{broadcast, mpsc};

const BROADCAST_CAPACITY: usize = 256;
pub const APP_LOGS: &str = "app_logs";
pub const DRYERS_STATS: &str = "dryers_stats";

pub fn dryer_logs_channel(dryer_id: i64) -> String {
    format!("dryer_{dryer_id}_logs")
}

/// A single fanned-out line, tagged with the channel it belongs to.
#[derive(Debug, Clone)]
pub struct LogBufferMessage {
    pub channel: String,
    pub line: String,
}

/// The receiving half of the broadcast registry. Runs as a scoped task:
/// drains the `mpsc` channel and republishes each message on the named
/// `broadcast::Sender` for its channel, lazily creating channels on first
/// use.
pub struct LogBufferActor {
    receiver: mpsc::UnboundedReceiver<LogBufferMessage>,
    channels: HashMap<String, broadcast::Sender<String>>,
    registry: Rc<RefCell<HashMap<String, broadcast::Sender<String>>>>,
}

impl LogBufferActor {
    pub async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            let sender = self.channel_sender(&msg.channel);
            // No subscribers is the common case and not an error.
            let _ = sender.send(msg.line);
        }
    }

    fn channel_sender(&mut self, name: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self.channels.get(name) {
            return tx.clone();
        }
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        self.channels.insert(name.to_string(), tx.clone());
        self.registry.borrow_mut().insert(name.to_string(), tx.clone());
        tx
    }
}

/// Shared handle used to send formatted lines into the buffer actor and to
/// subscribe to named channels from the HTTP layer.
#[derive(Clone)]
pub struct LogBufHandle {
    sender: mpsc::UnboundedSender<LogBufferMessage>,
    registry: Rc<RefCell<HashMap<String, broadcast::Sender<String>>>>,
}

impl LogBufHandle {
    pub fn new() -> (Self, LogBufferActor) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registry = Rc::new(RefCell::new(HashMap::new()));
        let handle = Self {
            sender,
            registry: registry.clone(),
        };
        let actor = LogBufferActor {
            receiver,
            channels: HashMap::new(),
            registry,
        };
        (handle, actor)
    }

    pub fn publish(&self, channel: &str, line: String) {
        let _ = self.sender.send(LogBufferMessage {
            channel: channel.to_string(),
            line,
        });
    }

    /// Subscribes to a channel, creating it (with no history) if it does
    /// not exist yet. Broadcast semantics: a subscriber only ever sees
    /// messages sent after it joined.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        if let Some(tx) = self.registry.borrow().get(channel) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
        self.registry.borrow_mut().insert(channel.to_string(), tx);
        rx
    }
}

/// Bridges synchronous `log` writes into the async buffer handle. `log`'s
/// formatter calls `write!` on whatever implements `std::io::Write`; we
/// buffer a line and flush it to the handle on `flush()`/newline.
struct BufferedWriter {
    handle: LogBufHandle,
    channel: String,
    buf: Vec<u8>,
}

impl std::io::Write for BufferedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.handle.publish(&self.channel, line);
            self.buf.clear();
        }
        Ok(())
    }
}

/// Installs the global logger at the given level filter and returns the
/// handle used to subscribe to fanned-out lines, plus the actor task that
/// must be spawned on the local set.
pub fn init(level: LevelFilter) -> (LogBufHandle, LogBufferActor) {
    let (handle, actor) = LogBufHandle::new();

    let journal_installed = systemd_journal_logger::JournalLog::new()
        .map(|journal| {
            journal
                .install()
                .map(|()| log::set_max_level(level))
                .is_ok()
        })
        .unwrap_or(false);

    if !journal_installed {
        let buf_handle = handle.clone();
        env_logger::Builder::new()
            .filter_level(level)
            .format(move |_fmt, record| {
                let mut writer = BufferedWriter {
                    handle: buf_handle.clone(),
                    channel: APP_LOGS.to_string(),
                    buf: Vec::new(),
                };
                writeln!(writer, "{} {} {}", record.level(), record.target(), record.args())?;
                writer.flush()?;
                eprintln!("{} {} {}", record.level(), record.target(), record.args());
                Ok(())
            })
            .init();
    }

    (handle, actor)
}
