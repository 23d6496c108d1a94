//! Dispatch loop and its handle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kit_twin_core::config::Config;
use kit_twin_core::protocol::{KitEvent, KitRequest};
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::{
    ErrorKind, LifecyclePhase, LoadingState, SessionIntent, Snapshot, StatusEvent,
    TransportEndpoint,
};
use kit_twin_session::SessionService;

use crate::events::{DomainEvent, TransportEvent};
use crate::lifecycle::{LifecycleController, LifecycleOptions};
use crate::prober::KitProber;
use crate::transport::{Transport, TransportConnector};
use crate::{scene, selection};

/// Owns the store and every component; processes [`DomainEvent`]s one at a time.
pub struct Orchestrator {
    store: TwinStore,
    lifecycle: LifecycleController,
    connector: TransportConnector,
    prober: KitProber,
    events_tx: mpsc::UnboundedSender<DomainEvent>,
    events_rx: mpsc::UnboundedReceiver<DomainEvent>,
}

/// Cheap, cloneable handle for driving a running [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<DomainEvent>,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        service: Arc<dyn SessionService>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = config.stream();
        let polling = config.polling();

        let lifecycle = LifecycleController::new(
            service,
            LifecycleOptions {
                service: config.service(),
                polling: polling.clone(),
                access_token: stream.access_token.clone(),
                reattach_on_stop: stream.reattach_on_stop,
            },
            events_tx.clone(),
        );

        Self {
            store: TwinStore::new(),
            lifecycle,
            connector: TransportConnector::new(transport, stream, events_tx.clone()),
            prober: KitProber::new(&polling),
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Start the dispatch loop on the current runtime.
    pub fn spawn(
        config: &Config,
        service: Arc<dyn SessionService>,
        transport: Arc<dyn Transport>,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let orchestrator = Self::new(config, service, transport);
        let handle = orchestrator.handle();
        (handle, tokio::spawn(orchestrator.run()))
    }

    pub async fn run(mut self) {
        info!("Orchestrator started");
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, DomainEvent::Shutdown) {
                break;
            }
            self.dispatch(event);
        }

        self.prober.stop();
        self.lifecycle.shutdown();
        self.connector.terminate();
        info!("Orchestrator stopped");
    }

    fn dispatch(&mut self, event: DomainEvent) {
        match event {
            DomainEvent::IntentChanged(intent) => {
                if self.store.set_intent(intent) {
                    debug!(intent = ?self.store.intent(), "Intent changed");
                    self.lifecycle
                        .on_intent(&mut self.store, &mut self.connector, &mut self.prober);
                }
            }
            DomainEvent::RequestScene(url) => {
                let request = scene::request_scene(&mut self.store, url);
                self.send(request);
            }
            DomainEvent::ToggleSelection(asset_id) => {
                let request = selection::toggle(&mut self.store, &asset_id);
                self.send(request);
            }
            DomainEvent::SetSelection(asset_ids) => {
                let request = selection::replace(&mut self.store, asset_ids);
                self.send(request);
            }
            DomainEvent::PublishStatus(event) => {
                let request = selection::publish_status(&mut self.store, event);
                self.send(request);
            }
            DomainEvent::ResetStage => {
                let request = scene::reset_stage(&self.store);
                self.send(request);
            }
            DomainEvent::SetDirectServer(server) => self.on_direct_server(server),
            DomainEvent::Transport { generation, event } => self.on_transport(generation, event),
            DomainEvent::Http(outcome) => self.lifecycle.on_http(
                outcome,
                &mut self.store,
                &mut self.connector,
                &mut self.prober,
            ),
            DomainEvent::PollTick { cycle } => self.lifecycle.on_poll_tick(cycle, &mut self.store),
            DomainEvent::ProbeTick { generation } => {
                let request = self.prober.on_tick(generation, &mut self.store);
                self.send(request);
            }
            DomainEvent::ResetSelectionOrigin => self.store.reset_selection_origin(),
            DomainEvent::Snapshot(reply) => {
                let _ = reply.send(self.store.snapshot(self.lifecycle.phase()));
            }
            DomainEvent::Shutdown => {}
        }
    }

    fn send(&self, request: Option<KitRequest>) {
        if let Some(request) = request {
            self.connector.send(&request);
        }
    }

    fn on_direct_server(&mut self, server: Option<String>) {
        match server.filter(|s| !s.is_empty()) {
            Some(server_url) => {
                if self.lifecycle.phase() != LifecyclePhase::Idle || self.store.session().is_some() {
                    warn!(%server_url, "A backend session is active; ignoring direct server");
                    return;
                }
                self.prober.stop();
                self.connector
                    .connect(&mut self.store, TransportEndpoint::Direct { server_url });
            }
            None => {
                if self.lifecycle.phase() == LifecyclePhase::Idle && self.connector.terminate() {
                    info!("Direct stream disconnected");
                    self.prober.stop();
                    self.store.teardown();
                }
            }
        }
    }

    fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.store.generation() {
            debug!(generation, current = self.store.generation(), "Ignoring stale transport event");
            return;
        }

        match event {
            TransportEvent::Started { success: true, .. } => {
                info!(generation, "Transport ready");
                self.prober.start(generation, &self.events_tx);
            }
            TransportEvent::Started {
                success: false,
                detail,
            } => {
                let detail = detail.unwrap_or_else(|| "stream did not start".into());
                warn!(generation, %detail, "Transport failed to start");
                self.store.record_error(ErrorKind::TransportSetup, detail);
            }
            TransportEvent::Updated(detail) => debug!(generation, %detail, "Transport update"),
            TransportEvent::Stopped => {
                info!(generation, "Transport stopped");
                self.connection_ended(generation);
            }
            TransportEvent::Terminated { reason } => {
                warn!(generation, reason = reason.as_deref().unwrap_or(""), "Transport terminated");
                self.connection_ended(generation);
            }
            TransportEvent::ConnectFailed(error) => {
                warn!(generation, %error, "Transport setup failed");
                self.store.record_error(ErrorKind::TransportSetup, error);
                self.connection_ended(generation);
            }
            TransportEvent::Message(text) => self.on_kit_message(generation, &text),
        }
    }

    fn connection_ended(&mut self, generation: u64) {
        self.prober.stop();
        self.connector.connection_ended(generation);
        if self.store.end_connection(generation) {
            self.lifecycle.on_transport_ended(&self.store);
        }
    }

    fn on_kit_message(&mut self, generation: u64, text: &str) {
        let event = match KitEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(generation, error = %e, "Dropping malformed kit message");
                return;
            }
        };
        debug!(generation, event_type = event.event_type(), "Kit message");

        match event {
            KitEvent::LoadingStateResponse { loading_state, url } => {
                self.prober.on_response(
                    generation,
                    &mut self.store,
                    LoadingState::from_kit(&loading_state),
                    url,
                );
            }
            KitEvent::OpenedStageResult { url, result, error } => {
                scene::on_opened_stage(&mut self.store, url, result, error);
            }
            KitEvent::StageSelectionChanged { prims } => {
                selection::on_kit_selection(&mut self.store, prims);
                let _ = self.events_tx.send(DomainEvent::ResetSelectionOrigin);
            }
            KitEvent::UpdateProgressAmount(amount) => {
                scene::on_progress_amount(&mut self.store, amount);
            }
            KitEvent::UpdateProgressActivity(activity) => {
                scene::on_progress_activity(&mut self.store, activity);
            }
            KitEvent::ResetStageResponse { result, error } => {
                scene::on_reset_response(&mut self.store, result, error);
            }
            KitEvent::Unknown { event_type, .. } => {
                debug!(generation, %event_type, "Ignoring unknown kit message");
            }
        }
    }
}

impl OrchestratorHandle {
    fn post(&self, event: DomainEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow::anyhow!("orchestrator is not running"))
    }

    pub fn set_intent(&self, intent: SessionIntent) -> anyhow::Result<()> {
        self.post(DomainEvent::IntentChanged(intent))
    }

    pub fn request_scene(&self, url: impl Into<String>) -> anyhow::Result<()> {
        self.post(DomainEvent::RequestScene(url.into()))
    }

    pub fn toggle_selection(&self, asset_id: impl Into<String>) -> anyhow::Result<()> {
        self.post(DomainEvent::ToggleSelection(asset_id.into()))
    }

    pub fn set_selection(&self, asset_ids: Vec<String>) -> anyhow::Result<()> {
        self.post(DomainEvent::SetSelection(asset_ids))
    }

    pub fn publish_status(&self, event: StatusEvent) -> anyhow::Result<()> {
        self.post(DomainEvent::PublishStatus(event))
    }

    pub fn reset_stage(&self) -> anyhow::Result<()> {
        self.post(DomainEvent::ResetStage)
    }

    pub fn set_direct_server(&self, server: Option<String>) -> anyhow::Result<()> {
        self.post(DomainEvent::SetDirectServer(server))
    }

    pub async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.post(DomainEvent::Snapshot(tx))?;
        Ok(rx.await?)
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.post(DomainEvent::Shutdown)
    }
}
