//! Kit custom-message protocol.
//!
//! Every message is a JSON object with an `event_type` string discriminator and
//! a `payload` object, exchanged as text over the realtime transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KitTwinError, Result};
use crate::types::AssetStatus;

/// Messages the client sends to Kit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "camelCase")]
pub enum KitRequest {
    /// Readiness probe; Kit answers with `loadingStateResponse`.
    LoadingStateQuery {},
    OpenStageRequest { url: String },
    SelectPrimsRequest { paths: Vec<String> },
    SetStatusRequest {
        asset_id: String,
        asset_status: AssetStatus,
    },
    /// Reset the viewport camera to the values captured when the stage opened.
    ResetStage {},
}

impl KitRequest {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LoadingStateQuery {} => "loadingStateQuery",
            Self::OpenStageRequest { .. } => "openStageRequest",
            Self::SelectPrimsRequest { .. } => "selectPrimsRequest",
            Self::SetStatusRequest { .. } => "setStatusRequest",
            Self::ResetStage {} => "resetStage",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages Kit sends to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum KitEvent {
    LoadingStateResponse {
        loading_state: String,
        url: String,
    },
    OpenedStageResult {
        url: String,
        result: Option<String>,
        error: Option<String>,
    },
    StageSelectionChanged {
        prims: Vec<String>,
    },
    UpdateProgressAmount(Value),
    UpdateProgressActivity(Value),
    ResetStageResponse {
        result: String,
        error: String,
    },
    /// Any `event_type` this client does not understand.
    Unknown {
        event_type: String,
        payload: Value,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct LoadingStatePayload {
    #[serde(default)]
    loading_state: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct OpenedStagePayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResetStagePayload {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl KitEvent {
    /// Decode a raw transport text message.
    ///
    /// Malformed JSON or a missing `event_type` is an error; an unrecognised
    /// `event_type` is not, it decodes to [`KitEvent::Unknown`].
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| KitTwinError::Protocol(format!("invalid kit message: {e}")))?;
        Self::from_parts(envelope.event_type, envelope.payload)
    }

    fn from_parts(event_type: String, payload: Value) -> Result<Self> {
        let payload_or_empty = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };

        let event = match event_type.as_str() {
            "loadingStateResponse" => {
                let p: LoadingStatePayload = parse_payload(&event_type, payload_or_empty)?;
                Self::LoadingStateResponse {
                    loading_state: p.loading_state.unwrap_or_default(),
                    url: p.url.unwrap_or_default(),
                }
            }
            "openedStageResult" => {
                let p: OpenedStagePayload = parse_payload(&event_type, payload_or_empty)?;
                Self::OpenedStageResult {
                    url: p.url.unwrap_or_default(),
                    result: p.result,
                    error: p.error.filter(|e| !e.is_empty()),
                }
            }
            "stageSelectionChanged" => {
                // A missing or non-array `prims` means an empty selection.
                let prims = payload_or_empty
                    .get("prims")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Self::StageSelectionChanged { prims }
            }
            "updateProgressAmount" => Self::UpdateProgressAmount(payload_or_empty),
            "updateProgressActivity" => Self::UpdateProgressActivity(payload_or_empty),
            "resetStageResponse" => {
                let p: ResetStagePayload = parse_payload(&event_type, payload_or_empty)?;
                Self::ResetStageResponse {
                    result: p.result.unwrap_or_default(),
                    error: p.error.unwrap_or_default(),
                }
            }
            _ => Self::Unknown {
                event_type,
                payload: payload_or_empty,
            },
        };
        Ok(event)
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::LoadingStateResponse { .. } => "loadingStateResponse",
            Self::OpenedStageResult { .. } => "openedStageResult",
            Self::StageSelectionChanged { .. } => "stageSelectionChanged",
            Self::UpdateProgressAmount(_) => "updateProgressAmount",
            Self::UpdateProgressActivity(_) => "updateProgressActivity",
            Self::ResetStageResponse { .. } => "resetStageResponse",
            Self::Unknown { event_type, .. } => event_type,
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(event_type: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| KitTwinError::Protocol(format!("bad {event_type} payload: {e}")))
}
