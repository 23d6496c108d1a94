//! Backend wire types and endpoint extraction.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::error;

use kit_twin_core::config::ServiceConfig;
use kit_twin_core::error::{KitTwinError, Result};
use kit_twin_core::types::TransportEndpoint;

/// Placeholder token the fleet accepts when no access token is configured.
pub const PLACEHOLDER_ACCESS_TOKEN: &str = "invalid-token";

/// Body of `POST /streaming/stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub arguments: CreateArguments,
    pub id: String,
    pub version: String,
    pub profile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateArguments {
    pub usd_stage_uri: String,
}

impl CreateSessionRequest {
    pub fn new(service: &ServiceConfig, stage_uri: Option<&str>) -> Self {
        Self {
            arguments: CreateArguments {
                usd_stage_uri: stage_uri.unwrap_or_default().to_string(),
            },
            id: service.app_id.clone(),
            version: service.version.clone(),
            profile: service.profile.clone(),
        }
    }
}

/// One network route of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRoute {
    /// Role tag: `signaling` or `media`.
    pub description: String,
    pub source_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRoutes {
    #[serde(default)]
    pub routes: Vec<StreamRoute>,
}

/// A session as reported by the backend. Route keys are server addresses, in
/// the order the backend listed them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamItem {
    pub id: String,
    #[serde(default)]
    pub routes: IndexMap<String, StreamRoutes>,
}

/// Body of `GET /streaming/stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamList {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub items: Vec<StreamItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Resolve the transport endpoint of a ready session.
///
/// Uses the first listed server and its `signaling` and `media` routes. Fails
/// closed when either route is missing so the transport never sees a partial
/// endpoint.
pub fn extract_endpoint(item: &StreamItem, access_token: Option<&str>) -> Result<TransportEndpoint> {
    let Some((server, routes)) = item.routes.first() else {
        error!(session_id = %item.id, "Session has no routes");
        return Err(KitTwinError::Session(format!(
            "session {} has no routes",
            item.id
        )));
    };

    let find = |role: &str| routes.routes.iter().find(|r| r.description == role);

    let (Some(signaling), Some(media)) = (find("signaling"), find("media")) else {
        error!(session_id = %item.id, %server, "Signaling or media route is missing");
        return Err(KitTwinError::Session(format!(
            "session {} on {server} is missing a signaling or media route",
            item.id
        )));
    };

    Ok(TransportEndpoint::Session {
        signaling_server: server.clone(),
        signaling_port: signaling.source_port,
        media_server: server.clone(),
        media_port: media.source_port,
        access_token: access_token
            .filter(|t| !t.is_empty())
            .unwrap_or(PLACEHOLDER_ACCESS_TOKEN)
            .to_string(),
        session_id: item.id.clone(),
    })
}
