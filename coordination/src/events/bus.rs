//! Event bus with per-session sequence ids and resumable streams
//!
//! Pub/sub uses a Tokio broadcast channel. Each session keeps a bounded
//! replay buffer so a consumer that dropped its stream can resume from
//! the last id it saw.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::{EngineEvent, EventEnvelope, EventId};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 1024;

/// Events retained per session for replay
const DEFAULT_REPLAY_CAPACITY: usize = 512;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Events after {requested} are no longer buffered (oldest retained: {oldest})")]
    ReplayGap { requested: EventId, oldest: EventId },

    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

#[derive(Debug, Default)]
struct SessionLog {
    next_id: EventId,
    buffer: VecDeque<EventEnvelope>,
}

/// Event bus with broadcast channels and per-session replay
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sessions: Mutex<HashMap<String, SessionLog>>,
    replay_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_replay_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Create an event bus retaining `capacity` events per session
    pub fn with_replay_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            sessions: Mutex::new(HashMap::new()),
            replay_capacity: capacity.max(1),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event for a session. Returns the assigned id.
    pub fn publish(&self, session_id: &str, event: EngineEvent) -> EventBusResult<EventId> {
        let event_type = event.event_type();
        let mut sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        let log = sessions.entry(session_id.to_string()).or_default();

        log.next_id += 1;
        let envelope = EventEnvelope {
            id: log.next_id,
            session_id: session_id.to_string(),
            event,
        };

        log.buffer.push_back(envelope.clone());
        while log.buffer.len() > self.replay_capacity {
            log.buffer.pop_front();
        }

        // Sent under the session lock so ids reach subscribers in order.
        let receivers = self.sender.send(envelope).unwrap_or(0);
        debug!(session_id, event_type, id = log.next_id, receivers, "Event published");
        Ok(log.next_id)
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Last id issued for a session
    pub fn last_id(&self, session_id: &str) -> Option<EventId> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(session_id).map(|l| l.next_id))
            .filter(|id| *id > 0)
    }

    /// Buffered events of a session with id greater than `last_id`.
    pub fn replay_since(&self, session_id: &str, last_id: EventId) -> EventBusResult<Vec<EventEnvelope>> {
        let sessions = self.sessions.lock().map_err(|_| EventBusError::LockPoisoned)?;
        let Some(log) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };

        if let Some(oldest) = log.buffer.front().map(|e| e.id) {
            if last_id + 1 < oldest {
                return Err(EventBusError::ReplayGap {
                    requested: last_id,
                    oldest,
                });
            }
        }

        Ok(log
            .buffer
            .iter()
            .filter(|e| e.id > last_id)
            .cloned()
            .collect())
    }

    /// Resume a session stream after `last_id`: buffered events first,
    /// then live ones, without duplicates.
    pub fn resume(&self, session_id: &str, last_id: EventId) -> EventBusResult<ResumableReceiver> {
        // Subscribe before reading the buffer so nothing falls in between.
        let receiver = self.subscribe();
        let backlog = self.replay_since(session_id, last_id)?;
        Ok(ResumableReceiver {
            backlog: backlog.into(),
            receiver: FilteredReceiver::new(receiver, EventFilter::new().session(session_id)),
            last_id,
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by session ID
    pub session_id: Option<String>,
    /// Filter by branch ID
    pub branch_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by session ID
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Filter by branch ID
    pub fn branch(mut self, branch_id: &str) -> Self {
        self.branch_id = Some(branch_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(ref sid) = self.session_id {
            if &envelope.session_id != sid {
                return false;
            }
        }

        if let Some(ref bid) = self.branch_id {
            if envelope.event.branch_id() != Some(bid.as_str()) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == envelope.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<EventEnvelope>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<EventEnvelope>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<EventEnvelope, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// Session stream that replays buffered events before live ones.
pub struct ResumableReceiver {
    backlog: VecDeque<EventEnvelope>,
    receiver: FilteredReceiver,
    last_id: EventId,
}

impl ResumableReceiver {
    /// Next event with an id greater than any already yielded.
    pub async fn recv(&mut self) -> Result<EventEnvelope, broadcast::error::RecvError> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_id = event.id;
            return Ok(event);
        }
        loop {
            let event = self.receiver.recv().await?;
            if event.id > self.last_id {
                self.last_id = event.id;
                return Ok(event);
            }
        }
    }

    pub fn last_id(&self) -> EventId {
        self.last_id
    }
}

/// Extension trait for subscribing with filters
pub trait EventBusExt {
    /// Subscribe with a filter
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}
