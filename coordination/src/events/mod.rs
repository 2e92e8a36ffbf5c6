//! Event sink for engine state transitions
//!
//! Every lock change, phase change, convergence trigger and graph write
//! is published as a typed [`EngineEvent`] wrapped in an
//! [`EventEnvelope`] carrying a per-session sequence id.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Lock service │────▶│  Event Bus   │────▶│  Subscribers │
//! │ Orchestrator │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │ replay buffer│──▶ resume(session, last_id)
//!                      │ (per session)│
//!                      └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let bus = EventBus::new().shared();
//! let mut stream = bus.resume("session-1", last_seen_id)?;
//! while let Ok(envelope) = stream.recv().await {
//!     print!("{}", envelope.to_sse());
//! }
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver,
    ResumableReceiver, SharedEventBus,
};
pub use types::{EngineEvent, EventEnvelope, EventId};
