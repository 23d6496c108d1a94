//! Session backend client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kit_twin_core::config::ServiceConfig;

use crate::routes::{CreateSessionRequest, StreamItem, StreamList};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Reply to create-session and session-info calls.
///
/// `item` is present when the body parsed as a session; `detail` carries the
/// backend's error text otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReply {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<StreamItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SessionReply {
    pub fn ok(status: u16, item: StreamItem) -> Self {
        Self {
            status,
            item: Some(item),
            detail: None,
        }
    }

    pub fn error(status: u16, detail: impl Into<String>) -> Self {
        Self {
            status,
            item: None,
            detail: Some(detail.into()),
        }
    }

    /// Session creation was accepted and is still starting up.
    pub fn is_pending(&self) -> bool {
        self.status == 202
    }

    pub fn is_rejected(&self) -> bool {
        self.status >= 400
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyReply {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DestroyReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Operations on the session-management backend.
///
/// `address` is the backend base URL taken from the caller's intent.
#[async_trait]
pub trait SessionService: Send + Sync + 'static {
    async fn create_session(
        &self,
        address: &str,
        request: &CreateSessionRequest,
    ) -> anyhow::Result<SessionReply>;

    async fn session_info(&self, address: &str, session_id: &str) -> anyhow::Result<SessionReply>;

    async fn list_sessions(&self, address: &str) -> anyhow::Result<StreamList>;

    async fn destroy_session(&self, address: &str, session_id: &str)
    -> anyhow::Result<DestroyReply>;
}

/// [`SessionService`] over HTTP.
pub struct HttpSessionClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpSessionClient {
    pub fn new(service: &ServiceConfig) -> anyhow::Result<Self> {
        let timeout = service
            .request_timeout_ms
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout))
            .build()?;
        Ok(Self {
            client,
            token: service.resolve_token(),
        })
    }

    fn endpoint(address: &str, path: &str) -> String {
        format!("{}{path}", address.trim_end_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn read_session_reply(resp: reqwest::Response) -> anyhow::Result<SessionReply> {
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if let Ok(item) = serde_json::from_str::<StreamItem>(&text) {
            return Ok(SessionReply::ok(status, item));
        }
        Ok(SessionReply::error(status, error_detail(&text)))
    }
}

/// Pull a readable message out of an error body (`{"detail": ...}` or raw text).
fn error_detail(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match value.get("detail") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        Err(_) => text.to_string(),
    }
}

#[async_trait]
impl SessionService for HttpSessionClient {
    async fn create_session(
        &self,
        address: &str,
        request: &CreateSessionRequest,
    ) -> anyhow::Result<SessionReply> {
        let url = Self::endpoint(address, "/streaming/stream");
        info!(
            %url,
            app = %request.id,
            stage = %request.arguments.usd_stage_uri,
            "Requesting streaming session"
        );

        let resp = self
            .authorize(self.client.post(&url).json(request))
            .send()
            .await?;
        let reply = Self::read_session_reply(resp).await?;
        debug!(status = reply.status, "Create session reply");
        Ok(reply)
    }

    async fn session_info(&self, address: &str, session_id: &str) -> anyhow::Result<SessionReply> {
        let url = Self::endpoint(address, &format!("/streaming/stream/{session_id}"));
        let resp = self.authorize(self.client.get(&url)).send().await?;
        let reply = Self::read_session_reply(resp).await?;
        debug!(%session_id, status = reply.status, "Session info reply");
        Ok(reply)
    }

    async fn list_sessions(&self, address: &str) -> anyhow::Result<StreamList> {
        let url = Self::endpoint(address, "/streaming/stream");
        let resp = self.authorize(self.client.get(&url)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("list sessions failed ({status}): {}", error_detail(&text));
        }
        Ok(resp.json::<StreamList>().await?)
    }

    async fn destroy_session(
        &self,
        address: &str,
        session_id: &str,
    ) -> anyhow::Result<DestroyReply> {
        let url = Self::endpoint(address, "/streaming/stream");
        info!(%session_id, "Destroying streaming session");

        let resp = self
            .authorize(
                self.client
                    .delete(&url)
                    .json(&serde_json::json!({ "id": session_id })),
            )
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            warn!(%session_id, status, "Destroy session rejected");
        }
        let detail = (!text.is_empty()).then_some(text);
        Ok(DestroyReply { status, detail })
    }
}
