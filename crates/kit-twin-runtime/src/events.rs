//! Typed events consumed by the dispatch loop.

use tokio::sync::oneshot;

use kit_twin_core::types::{SessionIntent, Snapshot, StatusEvent};
use kit_twin_session::{DestroyReply, SessionReply};

/// Lifecycle notifications from the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Started { success: bool, detail: Option<String> },
    Updated(String),
    Stopped,
    Terminated { reason: Option<String> },
    /// `connect` itself returned an error.
    ConnectFailed(String),
    /// Inbound custom message, undecoded.
    Message(String),
}

/// Completed backend calls. `cycle` identifies the intent cycle that issued them.
#[derive(Debug)]
pub enum HttpOutcome {
    Created {
        cycle: u64,
        address: String,
        result: anyhow::Result<SessionReply>,
    },
    Info {
        cycle: u64,
        session_id: String,
        result: anyhow::Result<SessionReply>,
    },
    Destroyed {
        cycle: u64,
        session_id: String,
        result: anyhow::Result<DestroyReply>,
    },
}

#[derive(Debug)]
pub enum DomainEvent {
    IntentChanged(SessionIntent),
    RequestScene(String),
    ToggleSelection(String),
    SetSelection(Vec<String>),
    PublishStatus(StatusEvent),
    ResetStage,
    /// Connect straight to a streaming server, bypassing the session backend.
    /// `None` disconnects.
    SetDirectServer(Option<String>),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Http(HttpOutcome),
    PollTick {
        cycle: u64,
    },
    ProbeTick {
        generation: u64,
    },
    /// Posted after a Kit-origin selection change; handled on the next turn.
    ResetSelectionOrigin,
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}
