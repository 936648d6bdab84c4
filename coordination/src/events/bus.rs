//! Event bus for analysis runs
//!
//! Provides pub/sub messaging using Tokio broadcast channels. The bus stamps
//! every event with a sequence number and can keep an in-memory history for
//! callers that do not stream.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::types::{Stage, StageStatus, StreamEvent};

/// Channel capacity for broadcast
pub const CHANNEL_CAPACITY: usize = 256;

/// Error type for event bus operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("Channel capacity must be greater than zero")]
    InvalidCapacity,

    #[error("Receiver lagged behind by {0} events")]
    Lagged(u64),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<broadcast::error::RecvError> for EventBusError {
    fn from(err: broadcast::error::RecvError) -> Self {
        match err {
            broadcast::error::RecvError::Closed => Self::ChannelClosed,
            broadcast::error::RecvError::Lagged(n) => Self::Lagged(n),
        }
    }
}

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

struct BusState {
    next_seq: u64,
    last_publish: Instant,
    history: Option<Vec<StreamEvent>>,
}

/// Event bus with broadcast channels and optional history
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
    /// Sequence assignment and send happen under this lock so `seq` order is
    /// delivery order.
    state: Mutex<BusState>,
}

impl EventBus {
    /// Create a new event bus without history
    pub fn new() -> Self {
        Self::build(CHANNEL_CAPACITY, false)
    }

    /// Create an event bus that records every published event
    pub fn with_history() -> Self {
        Self::build(CHANNEL_CAPACITY, true)
    }

    /// Create an event bus with an explicit channel capacity
    pub fn with_capacity(capacity: usize, record_history: bool) -> EventBusResult<Self> {
        if capacity == 0 {
            return Err(EventBusError::InvalidCapacity);
        }
        Ok(Self::build(capacity, record_history))
    }

    fn build(capacity: usize, record_history: bool) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Mutex::new(BusState {
                next_seq: 1,
                last_publish: Instant::now(),
                history: record_history.then(Vec::new),
            }),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Returns the assigned `seq`.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, mut event: StreamEvent) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        event.seq = state.next_seq;
        state.next_seq += 1;
        state.last_publish = Instant::now();
        if let Some(history) = state.history.as_mut() {
            history.push(event.clone());
        }

        let seq = event.seq;
        let stage = event.stage;
        match self.sender.send(event) {
            Ok(count) => trace!(seq, %stage, receivers = count, "Event published"),
            Err(_) => trace!(seq, %stage, "Event published (no receivers)"),
        }
        seq
    }

    /// Build and publish an event.
    pub fn emit(
        &self,
        session_id: &str,
        stage: Stage,
        status: StageStatus,
        payload: serde_json::Value,
    ) -> u64 {
        self.publish(StreamEvent::new(session_id, stage, status, payload))
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Recorded events, oldest first. Empty when history is off.
    pub fn history(&self) -> Vec<StreamEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.history.clone().unwrap_or_default()
    }

    /// Recorded events for one session.
    pub fn history_for(&self, session_id: &str) -> Vec<StreamEvent> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .history
            .iter()
            .flatten()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(history) = state.history.as_mut() {
            history.clear();
        }
    }

    /// Time since the last publish.
    pub fn idle_for(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_publish.elapsed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit `heartbeat/ready` for `session_id` whenever the bus has been idle
/// for `period`. Stops when `cancel` fires.
pub fn spawn_heartbeat(
    bus: SharedEventBus,
    session_id: String,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    if bus.idle_for() >= period {
                        bus.emit(
                            &session_id,
                            Stage::Heartbeat,
                            StageStatus::Ready,
                            serde_json::Value::Null,
                        );
                    }
                }
            }
        }
        debug!(session_id = %session_id, "Heartbeat stopped");
    })
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by session ID
    pub session_id: Option<String>,
    /// Filter by stage; `"agent"` matches every `agent:<role>` stage
    pub stages: Option<Vec<String>>,
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

    /// Filter by stages
    pub fn stages(mut self, stages: Vec<&str>) -> Self {
        self.stages = Some(stages.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if let Some(ref sid) = self.session_id {
            if &event.session_id != sid {
                return false;
            }
        }

        if let Some(ref stages) = self.stages {
            let full = event.stage.to_string();
            let family = event.stage.family();
            if !stages.iter().any(|s| *s == full || s == family) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<StreamEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<StreamEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> EventBusResult<StreamEvent> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
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
