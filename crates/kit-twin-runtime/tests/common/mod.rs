//! In-memory doubles for the session backend and the realtime transport.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use kit_twin_core::config::{Config, PollingConfig};
use kit_twin_core::types::Snapshot;
use kit_twin_runtime::{Orchestrator, OrchestratorHandle, StreamCallbacks, StreamSettings, Transport};
use kit_twin_session::{
    CreateSessionRequest, DestroyReply, SessionReply, SessionService, StreamItem, StreamList,
};

pub const ADDRESS: &str = "http://svc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create { address: String, stage: String },
    Info { address: String, session_id: String },
    List,
    Destroy { address: String, session_id: String },
}

/// Session whose routes resolve to `10.0.0.1:1000` / `10.0.0.1:2000`.
pub fn ready_item(id: &str) -> StreamItem {
    serde_json::from_value(json!({
        "id": id,
        "routes": {
            "10.0.0.1": {
                "routes": [
                    {"description": "signaling", "source_port": 1000},
                    {"description": "media", "source_port": 2000}
                ]
            }
        }
    }))
    .unwrap()
}

pub fn pending_item(id: &str) -> StreamItem {
    serde_json::from_value(json!({"id": id, "routes": {}})).unwrap()
}

#[derive(Default)]
struct FakeState {
    create: VecDeque<Option<SessionReply>>,
    info: VecDeque<SessionReply>,
    calls: Vec<Call>,
    created: usize,
}

/// Scripted session backend.
///
/// Create replies are taken from the queue (`None` = unreachable); once empty,
/// each create returns a ready session `s{n}`. Info replies are taken from the
/// queue; once empty, the session reports `404` forever.
#[derive(Default)]
pub struct FakeSessionService {
    state: Mutex<FakeState>,
    create_delay: Mutex<Duration>,
}

impl FakeSessionService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_create(&self, reply: SessionReply) {
        self.state.lock().unwrap().create.push_back(Some(reply));
    }

    pub fn push_create_unreachable(&self) {
        self.state.lock().unwrap().create.push_back(None);
    }

    pub fn push_info(&self, reply: SessionReply) {
        self.state.lock().unwrap().info.push_back(reply);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| matches(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create { .. }))
    }

    pub fn infos(&self) -> usize {
        self.count(|c| matches!(c, Call::Info { .. }))
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Destroy { session_id, .. } => Some(session_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionService for FakeSessionService {
    async fn create_session(
        &self,
        address: &str,
        request: &CreateSessionRequest,
    ) -> anyhow::Result<SessionReply> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Create {
            address: address.to_string(),
            stage: request.arguments.usd_stage_uri.clone(),
        });
        state.created += 1;
        match state.create.pop_front() {
            Some(Some(reply)) => Ok(reply),
            Some(None) => anyhow::bail!("connection refused"),
            None => {
                let id = format!("s{}", state.created);
                Ok(SessionReply::ok(200, ready_item(&id)))
            }
        }
    }

    async fn session_info(&self, address: &str, session_id: &str) -> anyhow::Result<SessionReply> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Info {
            address: address.to_string(),
            session_id: session_id.to_string(),
        });
        Ok(state
            .info
            .pop_front()
            .unwrap_or_else(|| SessionReply::error(404, "starting")))
    }

    async fn list_sessions(&self, _address: &str) -> anyhow::Result<StreamList> {
        self.state.lock().unwrap().calls.push(Call::List);
        Ok(StreamList::default())
    }

    async fn destroy_session(
        &self,
        address: &str,
        session_id: &str,
    ) -> anyhow::Result<DestroyReply> {
        self.state.lock().unwrap().calls.push(Call::Destroy {
            address: address.to_string(),
            session_id: session_id.to_string(),
        });
        Ok(DestroyReply {
            status: 200,
            detail: None,
        })
    }
}

#[derive(Default)]
struct Recorded {
    connects: Vec<StreamSettings>,
    callbacks: Vec<StreamCallbacks>,
    sent: Vec<String>,
    terminations: usize,
    fail_connect: bool,
}

/// Transport that records everything and lets tests play the Kit side.
///
/// `connect` succeeds and reports `on_start(true)` unless told to fail.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recorded>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connects(&self) {
        self.inner.lock().unwrap().fail_connect = true;
    }

    pub fn connects(&self) -> Vec<StreamSettings> {
        self.inner.lock().unwrap().connects.clone()
    }

    pub fn terminations(&self) -> usize {
        self.inner.lock().unwrap().terminations
    }

    /// Callbacks of the most recent connection.
    pub fn callbacks(&self) -> StreamCallbacks {
        self.inner
            .lock()
            .unwrap()
            .callbacks
            .last()
            .cloned()
            .expect("transport was never connected")
    }

    pub fn sent(&self) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn sent_of(&self, event_type: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|m| m["event_type"] == event_type)
            .collect()
    }

    /// Deliver a Kit message on the current connection.
    pub fn kit_says(&self, message: Value) {
        self.callbacks().on_custom_message(message.to_string());
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn connect(
        &self,
        settings: StreamSettings,
        callbacks: StreamCallbacks,
    ) -> anyhow::Result<()> {
        let fail = {
            let mut inner = self.inner.lock().unwrap();
            inner.connects.push(settings);
            inner.callbacks.push(callbacks.clone());
            inner.fail_connect
        };
        if fail {
            anyhow::bail!("signaling server refused connection");
        }
        callbacks.on_start(true, None);
        Ok(())
    }

    fn send_message(&self, text: &str) -> anyhow::Result<()> {
        self.inner.lock().unwrap().sent.push(text.to_string());
        Ok(())
    }

    fn terminate(&self, _generation: u64) {
        self.inner.lock().unwrap().terminations += 1;
    }
}

/// Config with short poll intervals.
pub fn fast_config() -> Config {
    Config {
        polling: Some(PollingConfig {
            session_ready_interval_ms: 100,
            kit_probe_interval_ms: 50,
            ..PollingConfig::default()
        }),
        ..Config::default()
    }
}

pub struct Harness {
    pub handle: OrchestratorHandle,
    pub service: Arc<FakeSessionService>,
    pub transport: Arc<RecordingTransport>,
}

pub fn start(config: Config) -> Harness {
    let service = FakeSessionService::new();
    let transport = RecordingTransport::new();
    let (handle, _task) = Orchestrator::spawn(&config, service.clone(), transport.clone());
    Harness {
        handle,
        service,
        transport,
    }
}

impl Harness {
    pub async fn snapshot(&self) -> Snapshot {
        self.handle.snapshot().await.unwrap()
    }

    /// Poll the snapshot until `pred` holds, letting paused time advance.
    pub async fn wait_for(&self, what: &str, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        for _ in 0..5000 {
            let snapshot = self.snapshot().await;
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}: {:#?}", self.snapshot().await);
    }

    pub async fn wait_until(&self, what: &str, cond: impl Fn() -> bool) {
        for _ in 0..5000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Let paused time run for `duration`.
    pub async fn idle(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        let _ = self.snapshot().await;
    }

    /// Connect directly and answer the probe, leaving Kit responsive.
    pub async fn responsive_direct(&self, loading_state: &str, url: &str) -> Snapshot {
        self.handle
            .set_direct_server(Some("127.0.0.1:49100".into()))
            .unwrap();
        self.wait_until("first probe", || {
            !self.transport.sent_of("loadingStateQuery").is_empty()
        })
        .await;
        self.transport.kit_says(json!({
            "event_type": "loadingStateResponse",
            "payload": {"loading_state": loading_state, "url": url}
        }));
        self.wait_for("kit responsive", |s| {
            s.kit_state == kit_twin_core::types::KitState::Responsive
        })
        .await
    }
}
