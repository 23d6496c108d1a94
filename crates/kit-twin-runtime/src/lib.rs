//! Runtime for kit-twin: drives a streaming session from intent to a
//! responsive Kit instance and keeps scene, selection and status in sync.
//!
//! Everything runs through a single dispatch task ([`Orchestrator`]) that owns
//! the [`TwinStore`](kit_twin_core::store::TwinStore). I/O happens in spawned
//! tasks that report back as [`DomainEvent`]s.

pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod prober;
pub mod scene;
pub mod selection;
pub mod transport;
pub mod ws_transport;

pub use events::{DomainEvent, HttpOutcome, TransportEvent};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use transport::{StreamCallbacks, StreamSettings, Transport};
pub use ws_transport::WebSocketTransport;
