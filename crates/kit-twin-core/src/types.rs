use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// What the caller wants the remote session to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    #[default]
    Connected,
    Destroyed,
}

/// Caller-owned intent driving the lifecycle controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIntent {
    pub address: String,
    pub desired_state: DesiredState,
}

impl SessionIntent {
    pub fn connected(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            desired_state: DesiredState::Connected,
        }
    }

    pub fn destroyed(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            desired_state: DesiredState::Destroyed,
        }
    }

    /// Connected intent with a usable backend address.
    pub fn wants_session(&self) -> bool {
        self.desired_state == DesiredState::Connected && !self.address.is_empty()
    }
}

/// A backend-allocated streaming session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub session_id: String,
    /// Backend that created the session; every later call for it goes here.
    pub address: String,
    pub status: u16,
}

/// Where the realtime transport should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportEndpoint {
    /// Routed session on the streaming fleet.
    Session {
        signaling_server: String,
        signaling_port: u16,
        media_server: String,
        media_port: u16,
        access_token: String,
        session_id: String,
    },
    /// A single directly reachable streaming server.
    Direct { server_url: String },
}

impl TransportEndpoint {
    pub fn describe(&self) -> String {
        match self {
            Self::Session {
                signaling_server,
                signaling_port,
                session_id,
                ..
            } => format!("{signaling_server}:{signaling_port} (session {session_id})"),
            Self::Direct { server_url } => server_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KitState {
    #[default]
    Unknown,
    Responsive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingState {
    #[default]
    Idle,
    Loading,
}

impl LoadingState {
    /// Kit reports `idle` or anything else (`busy`, ...), which counts as loading.
    pub fn from_kit(value: &str) -> Self {
        if value == "idle" {
            Self::Idle
        } else {
            Self::Loading
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneLoadState {
    pub requested_url: String,
    pub loading_state: LoadingState,
    pub loaded_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOrigin {
    #[default]
    Client,
    Kit,
}

/// Shared object selection. Insertion ordered, no duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionState {
    pub asset_ids: IndexSet<String>,
    pub origin: SelectionOrigin,
}

impl SelectionState {
    pub fn paths(&self) -> Vec<String> {
        self.asset_ids.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Nominal,
    Warning,
    Fault,
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Nominal => "nominal",
            Self::Warning => "warning",
            Self::Fault => "fault",
        };
        f.write_str(s)
    }
}

impl FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nominal" => Ok(Self::Nominal),
            "warning" => Ok(Self::Warning),
            "fault" => Ok(Self::Fault),
            other => Err(format!("unknown asset status '{other}'")),
        }
    }
}

/// Asset health report produced locally (e.g. from telemetry ingestion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub asset_id: String,
    pub asset_status: AssetStatus,
    pub produced_at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(asset_id: impl Into<String>, asset_status: AssetStatus) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_status,
            produced_at: Utc::now(),
        }
    }
}

/// Last progress payloads reported by Kit while loading a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session backend answered the create call with status >= 400.
    BackendRejected,
    /// Session backend could not be reached.
    BackendUnreachable,
    /// Session routes lack a signaling or media entry.
    EndpointUnresolved,
    /// Session never became ready within the configured poll ceiling.
    SessionNotReady,
    TransportSetup,
    /// Kit never answered the readiness probe within the configured ceiling.
    KitUnresponsive,
    StageOpen,
    StageReset,
}

/// Most recent failure surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Idle,
    Requesting,
    AwaitingReady,
    Attached,
    Destroying,
}

/// Point-in-time copy of everything the orchestrator tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub intent: SessionIntent,
    pub phase: LifecyclePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<RemoteSession>,
    pub http_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<TransportEndpoint>,
    pub kit_state: KitState,
    pub generation: u64,
    pub scene: SceneLoadState,
    pub selection: SelectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<StatusEvent>,
    pub progress: LoadProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}
