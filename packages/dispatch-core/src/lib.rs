//! dispatch-core - ingest and state-management engine for a trunked-radio
//! recorder fleet.
//!
//! # Architecture
//!
//! The crate is organized around the components named in the design doc:
//!
//! - [`identity`]: System/site/talkgroup/unit identity resolution (C1)
//! - [`handlers`]: Tagged-record dispatch table (C2)
//! - [`call_state`]: Active-call state machine (C3)
//! - [`audio_store`]: Tiered local/object audio storage (C4)
//! - [`transcription`]: Bounded STT worker pool (C5)
//! - [`events`]: Canonical event types and the subscriber hub (C6)
//! - [`ingest`]: MQTT, directory-watch, and HTTP-upload sources (C7)
//! - [`metrics`]: Prometheus registry (C8)
//! - [`shutdown`]: Ordered drain sequence (C9)
//! - [`bootstrap`]: Composition root (C10)
//! - [`api`]: HTTP query API, SSE stream, metrics scrape (C11, C12)
//! - [`error`]: Centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod audio_store;
pub mod bootstrap;
pub mod call_state;
pub mod error;
pub mod events;
pub mod handlers;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod records;
pub mod shutdown;
pub mod transcription;

// Re-export commonly used types at the crate root
pub use bootstrap::{bootstrap, BootstrappedEngine, EngineConfig, ObjectStoreConfig, SttConfig};
pub use error::{EngineError, EngineResult, ErrorCode};

// Re-export API types
pub use api::{start_server, ApiState, AuthConfig, ServerError};
