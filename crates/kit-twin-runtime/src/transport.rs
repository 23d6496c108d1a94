//! Realtime transport seam and the connector that owns the active connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use kit_twin_core::config::StreamConfig;
use kit_twin_core::protocol::KitRequest;
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::TransportEndpoint;

use crate::events::{DomainEvent, TransportEvent};

/// Everything a transport needs to open a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub endpoint: TransportEndpoint,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub cursor: String,
    pub max_reconnects: u32,
    pub connectivity_timeout: Duration,
}

impl StreamSettings {
    pub fn new(endpoint: TransportEndpoint, stream: &StreamConfig) -> Self {
        let max_reconnects = match endpoint {
            TransportEndpoint::Session { .. } => stream.max_reconnects,
            TransportEndpoint::Direct { .. } => stream.direct_max_reconnects,
        };
        Self {
            endpoint,
            width: stream.width,
            height: stream.height,
            fps: stream.fps,
            cursor: stream.cursor.clone(),
            max_reconnects,
            connectivity_timeout: Duration::from_millis(stream.connectivity_timeout_ms),
        }
    }

    /// Signaling URL for this endpoint.
    pub fn url(&self) -> String {
        match &self.endpoint {
            TransportEndpoint::Direct { server_url } => {
                if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
                    server_url.clone()
                } else {
                    format!("ws://{server_url}")
                }
            }
            TransportEndpoint::Session {
                signaling_server,
                signaling_port,
                session_id,
                ..
            } => format!("ws://{signaling_server}:{signaling_port}/?session_id={session_id}"),
        }
    }
}

/// Callbacks handed to [`Transport::connect`], bound to one connection
/// generation. Every call posts a [`DomainEvent::Transport`]; the dispatch loop
/// drops events whose generation is no longer current.
#[derive(Debug, Clone)]
pub struct StreamCallbacks {
    generation: u64,
    events: mpsc::UnboundedSender<DomainEvent>,
}

impl StreamCallbacks {
    pub fn new(generation: u64, events: mpsc::UnboundedSender<DomainEvent>) -> Self {
        Self { generation, events }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn on_start(&self, success: bool, detail: Option<String>) {
        self.post(TransportEvent::Started { success, detail });
    }

    pub fn on_update(&self, detail: impl Into<String>) {
        self.post(TransportEvent::Updated(detail.into()));
    }

    pub fn on_stop(&self) {
        self.post(TransportEvent::Stopped);
    }

    pub fn on_terminate(&self, reason: Option<String>) {
        self.post(TransportEvent::Terminated { reason });
    }

    pub fn on_custom_message(&self, text: impl Into<String>) {
        self.post(TransportEvent::Message(text.into()));
    }

    fn on_connect_failed(&self, error: String) {
        self.post(TransportEvent::ConnectFailed(error));
    }

    fn post(&self, event: TransportEvent) {
        if self
            .events
            .send(DomainEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_err()
        {
            debug!(generation = self.generation, "Dispatch loop gone; dropping transport event");
        }
    }
}

/// A realtime connection to a streaming server carrying Kit custom messages.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream. Returns once setup succeeded or failed; later lifecycle
    /// changes arrive through `callbacks`.
    async fn connect(&self, settings: StreamSettings, callbacks: StreamCallbacks)
    -> anyhow::Result<()>;

    fn send_message(&self, text: &str) -> anyhow::Result<()>;

    /// Tear down connection `generation`, whether it is open or still being
    /// set up. A later `connect` for this or an older generation must fail.
    /// Idempotent.
    fn terminate(&self, generation: u64);
}

/// Owns the single active transport connection.
pub struct TransportConnector {
    transport: Arc<dyn Transport>,
    stream: StreamConfig,
    events: mpsc::UnboundedSender<DomainEvent>,
    active: Option<u64>,
}

impl TransportConnector {
    pub fn new(
        transport: Arc<dyn Transport>,
        stream: StreamConfig,
        events: mpsc::UnboundedSender<DomainEvent>,
    ) -> Self {
        Self {
            transport,
            stream,
            events,
            active: None,
        }
    }

    /// Generation of the connection currently open or opening.
    pub fn active(&self) -> Option<u64> {
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Connect to `endpoint`, terminating any prior connection first.
    pub fn connect(&mut self, store: &mut TwinStore, endpoint: TransportEndpoint) -> u64 {
        self.terminate();

        let settings = StreamSettings::new(endpoint.clone(), &self.stream);
        store.attach_endpoint(endpoint);
        let generation = store.begin_connection();
        self.active = Some(generation);

        info!(
            generation,
            url = %settings.url(),
            max_reconnects = settings.max_reconnects,
            "Connecting transport"
        );

        let transport = self.transport.clone();
        let callbacks = StreamCallbacks::new(generation, self.events.clone());
        tokio::spawn(async move {
            if let Err(e) = transport.connect(settings, callbacks.clone()).await {
                callbacks.on_connect_failed(e.to_string());
            }
        });

        generation
    }

    /// Terminate the active connection. Returns `false` when none was open.
    pub fn terminate(&mut self) -> bool {
        let Some(generation) = self.active.take() else {
            return false;
        };
        debug!(generation, "Terminating transport");
        self.transport.terminate(generation);
        true
    }

    /// The connection of `generation` ended on its own.
    pub fn connection_ended(&mut self, generation: u64) {
        if self.active == Some(generation) {
            self.active = None;
        }
    }

    /// Send a Kit request over the active connection. Failures are logged.
    pub fn send(&self, request: &KitRequest) -> bool {
        let Some(generation) = self.active else {
            debug!(event_type = request.event_type(), "No active transport; not sending");
            return false;
        };
        let text = match request.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(event_type = request.event_type(), error = %e, "Failed to encode kit request");
                return false;
            }
        };
        match self.transport.send_message(&text) {
            Ok(()) => {
                debug!(generation, event_type = request.event_type(), "Sent kit request");
                true
            }
            Err(e) => {
                warn!(generation, event_type = request.event_type(), error = %e, "Failed to send kit request");
                false
            }
        }
    }
}
