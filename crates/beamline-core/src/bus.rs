//! Message bus abstraction and the in-process implementation.
//!
//! The bus offers two primitives:
//!
//! - ordered publish/subscribe of [`BusMessage`]s
//! - append-only streams addressed by key (the readings of each scan live in
//!   [`readings_stream`])
//!
//! [`LocalBus`] implements both in memory on top of a tokio broadcast channel.
//! Slow subscribers that fall more than `capacity` messages behind observe
//! `RecvError::Lagged`. A stream is never truncated while it is kept, but the
//! bus only keeps the most recently created [`STREAM_RETENTION`] streams by
//! default and drops whole streams, oldest first, beyond that.

use crate::ids::RequestId;
use crate::limits::STREAM_RETENTION;
use crate::messages::BusMessage;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Stream key holding the readings of one scan.
pub fn readings_stream(rid: &RequestId) -> String {
    format!("readings/{rid}")
}

/// Logical channel of a message, for filtering subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Scan submissions
    ScanRequests,
    /// Request accept/reject responses
    RequestResponses,
    /// Queue snapshots and entry transitions
    Queue,
    /// Scan metadata and report instructions
    ScanStatus,
    /// Device instructions and acknowledgements
    DeviceTraffic,
    /// Device readings
    Readings,
    /// Acquisition progress
    Progress,
}

impl Topic {
    /// Topic a message is published under.
    pub fn of(message: &BusMessage) -> Topic {
        match message {
            BusMessage::ScanRequest(_) => Topic::ScanRequests,
            BusMessage::RequestResponse(_) => Topic::RequestResponses,
            BusMessage::QueueStatus(_) | BusMessage::EntryTransition(_) => Topic::Queue,
            BusMessage::ScanStatus(_) | BusMessage::ReportInstructions(_) => Topic::ScanStatus,
            BusMessage::DeviceInstruction(_) | BusMessage::DeviceAck(_) => Topic::DeviceTraffic,
            BusMessage::Reading(_) => Topic::Readings,
            BusMessage::Progress(_) => Topic::Progress,
        }
    }
}

/// Publish/subscribe transport used by the engine.
///
/// Implementations must deliver messages to each subscriber in publish order.
pub trait MessageBus: Send + Sync {
    /// Broadcast a message to all current subscribers.
    fn publish(&self, message: BusMessage);

    /// Receive every message published from now on.
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;

    /// Append a message to the stream under `key`.
    fn append(&self, key: &str, message: BusMessage);

    /// All messages appended to the stream under `key`, oldest first.
    fn read_stream(&self, key: &str) -> Vec<BusMessage>;
}

#[derive(Default)]
struct Streams {
    by_key: HashMap<String, Vec<BusMessage>>,
    created: VecDeque<String>,
}

/// In-process [`MessageBus`].
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
    streams: RwLock<Streams>,
    max_streams: usize,
    journal: Option<Mutex<Vec<BusMessage>>>,
}

impl LocalBus {
    /// Bus whose subscribers may lag by at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            streams: RwLock::new(Streams::default()),
            max_streams: STREAM_RETENTION,
            journal: None,
        }
    }

    /// Keep at most `max_streams` streams.
    pub fn with_stream_retention(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams.max(1);
        self
    }

    /// Bus that additionally keeps every published message.
    ///
    /// Meant for tests and short CLI runs; the journal grows without bound.
    pub fn recording(capacity: usize) -> Self {
        Self {
            journal: Some(Mutex::new(Vec::new())),
            ..Self::new(capacity)
        }
    }

    /// Every message published so far, if recording.
    pub fn journal(&self) -> Vec<BusMessage> {
        self.journal
            .as_ref()
            .map(|j| j.lock().clone())
            .unwrap_or_default()
    }

    /// Journal entries matching `filter`.
    pub fn journal_filtered<F>(&self, filter: F) -> Vec<BusMessage>
    where
        F: Fn(&BusMessage) -> bool,
    {
        self.journal().into_iter().filter(|m| filter(m)).collect()
    }

    /// Keys of all streams written so far.
    pub fn stream_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.streams.read().by_key.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, message: BusMessage) {
        trace!(topic = ?Topic::of(&message), "publishing bus message");
        if let Some(journal) = &self.journal {
            journal.lock().push(message.clone());
        }
        // No subscribers is not an error for a broadcast bus.
        let _ = self.sender.send(message);
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    fn append(&self, key: &str, message: BusMessage) {
        let mut guard = self.streams.write();
        let streams = &mut *guard;
        if let Some(stream) = streams.by_key.get_mut(key) {
            stream.push(message);
            return;
        }
        while streams.created.len() >= self.max_streams {
            let Some(oldest) = streams.created.pop_front() else {
                break;
            };
            streams.by_key.remove(&oldest);
            debug!(stream = %oldest, "stream dropped from retention");
        }
        streams.created.push_back(key.to_string());
        streams.by_key.insert(key.to_string(), vec![message]);
    }

    fn read_stream(&self, key: &str) -> Vec<BusMessage> {
        self.streams.read().by_key.get(key).cloned().unwrap_or_default()
    }
}
