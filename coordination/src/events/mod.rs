//! Event stream for analysis runs
//!
//! Every stage of a run publishes ordered `{seq, session_id, stage, status,
//! payload, timestamp}` records to an [`EventBus`].
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Engine/Debate│────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │   History    │
//!                      │  (optional)  │
//!                      └──────────────┘
//! ```
//!
//! A run's stream always ends with a `done` event; failures publish `error`
//! first.

pub mod bus;
pub mod types;

pub use bus::{
    spawn_heartbeat, EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter,
    FilteredReceiver, SharedEventBus, CHANNEL_CAPACITY,
};
pub use types::{Stage, StageStatus, StreamEvent};
