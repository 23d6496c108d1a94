//! Session lifecycle controller.
//!
//! Turns the caller's [`SessionIntent`] into backend calls: create a session,
//! poll until it is ready, resolve its endpoint and hand it to the transport,
//! and destroy it again. At most one backend call is in flight per cycle, and
//! every reply carries the cycle that issued it so late replies are dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kit_twin_core::config::{PollingConfig, ServiceConfig};
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::{
    DesiredState, ErrorKind, LifecyclePhase, SessionIntent, TransportEndpoint,
};
use kit_twin_session::{
    CreateSessionRequest, DestroyReply, SessionReply, SessionService, StreamItem, extract_endpoint,
};

use crate::events::{DomainEvent, HttpOutcome};
use crate::prober::KitProber;
use crate::transport::TransportConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Requesting,
    AwaitingReady { session_id: String, address: String },
    Attached { endpoint: TransportEndpoint },
    Destroying,
}

pub struct LifecycleOptions {
    pub service: ServiceConfig,
    pub polling: PollingConfig,
    pub access_token: Option<String>,
    pub reattach_on_stop: bool,
}

pub struct LifecycleController {
    service: Arc<dyn SessionService>,
    options: LifecycleOptions,
    events: mpsc::UnboundedSender<DomainEvent>,
    phase: Phase,
    cycle: u64,
    pending_destroy: bool,
    poll: Option<CancellationToken>,
    poll_attempts: u32,
    info_in_flight: bool,
}

impl LifecycleController {
    pub fn new(
        service: Arc<dyn SessionService>,
        options: LifecycleOptions,
        events: mpsc::UnboundedSender<DomainEvent>,
    ) -> Self {
        Self {
            service,
            options,
            events,
            phase: Phase::Idle,
            cycle: 0,
            pending_destroy: false,
            poll: None,
            poll_attempts: 0,
            info_in_flight: false,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self.phase {
            Phase::Idle => LifecyclePhase::Idle,
            Phase::Requesting => LifecyclePhase::Requesting,
            Phase::AwaitingReady { .. } => LifecyclePhase::AwaitingReady,
            Phase::Attached { .. } => LifecyclePhase::Attached,
            Phase::Destroying => LifecyclePhase::Destroying,
        }
    }

    /// React to the intent currently held by `store`.
    pub fn on_intent(
        &mut self,
        store: &mut TwinStore,
        connector: &mut TransportConnector,
        prober: &mut KitProber,
    ) {
        let intent = store.intent().clone();

        if intent.wants_session() {
            match self.phase {
                Phase::Idle if store.session().is_none() => self.start_request(store, &intent),
                Phase::Requesting if self.pending_destroy => {
                    debug!("Connect intent restored; dropping deferred destroy");
                    self.pending_destroy = false;
                }
                _ => {}
            }
            return;
        }

        if intent.desired_state != DesiredState::Destroyed {
            return;
        }

        match self.phase.clone() {
            Phase::Idle => {
                if let Some(session) = store.session().cloned() {
                    self.begin_destroy(session.session_id, session.address);
                } else if connector.terminate() {
                    info!("Disconnecting direct stream");
                    prober.stop();
                    store.teardown();
                }
            }
            Phase::Requesting => {
                debug!("Destroy requested before session id is known; deferring");
                self.pending_destroy = true;
            }
            Phase::AwaitingReady {
                session_id,
                address,
            } => {
                self.begin_destroy(session_id, address);
            }
            Phase::Attached { .. } => match store.session().cloned() {
                Some(session) => self.begin_destroy(session.session_id, session.address),
                None => {
                    connector.terminate();
                    prober.stop();
                    store.teardown();
                    self.phase = Phase::Idle;
                }
            },
            Phase::Destroying => {}
        }
    }

    fn start_request(&mut self, store: &mut TwinStore, intent: &SessionIntent) {
        self.cycle += 1;
        self.pending_destroy = false;
        store.clear_error();

        let scene = store.scene().requested_url.clone();
        if !scene.is_empty() {
            store.mark_scene_loading();
        }
        let request = CreateSessionRequest::new(
            &self.options.service,
            (!scene.is_empty()).then_some(scene.as_str()),
        );

        info!(cycle = self.cycle, address = %intent.address, stage = %scene, "Requesting session");
        self.phase = Phase::Requesting;

        let cycle = self.cycle;
        let service = self.service.clone();
        let events = self.events.clone();
        let address = intent.address.clone();
        tokio::spawn(async move {
            let result = service.create_session(&address, &request).await;
            let _ = events.send(DomainEvent::Http(HttpOutcome::Created {
                cycle,
                address,
                result,
            }));
        });
    }

    pub fn on_http(
        &mut self,
        outcome: HttpOutcome,
        store: &mut TwinStore,
        connector: &mut TransportConnector,
        prober: &mut KitProber,
    ) {
        match outcome {
            HttpOutcome::Created {
                cycle,
                address,
                result,
            } => {
                if self.is_current(cycle, LifecyclePhase::Requesting) {
                    self.on_created(address, result, store, connector);
                } else {
                    debug!(cycle, "Dropping stale create reply");
                }
            }
            HttpOutcome::Info {
                cycle,
                session_id,
                result,
            } => {
                if cycle == self.cycle {
                    self.info_in_flight = false;
                }
                let awaited = matches!(
                    &self.phase,
                    Phase::AwaitingReady { session_id: waiting, .. }
                        if cycle == self.cycle && *waiting == session_id
                );
                if awaited {
                    self.on_info(session_id, result, store, connector);
                } else {
                    debug!(cycle, %session_id, "Dropping stale session info");
                }
            }
            HttpOutcome::Destroyed {
                cycle,
                session_id,
                result,
            } => {
                if self.is_current(cycle, LifecyclePhase::Destroying) {
                    self.on_destroyed(session_id, result, store, connector, prober);
                } else {
                    debug!(cycle, %session_id, "Dropping stale destroy reply");
                }
            }
        }
    }

    fn is_current(&self, cycle: u64, phase: LifecyclePhase) -> bool {
        cycle == self.cycle && self.phase() == phase
    }

    fn on_created(
        &mut self,
        address: String,
        result: anyhow::Result<SessionReply>,
        store: &mut TwinStore,
        connector: &mut TransportConnector,
    ) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "Session backend unreachable");
                store.record_http_status(0);
                store.record_error(ErrorKind::BackendUnreachable, e.to_string());
                self.settle_idle();
                return;
            }
        };

        if reply.is_rejected() {
            let detail = reply.detail.unwrap_or_default();
            error!(status = reply.status, %detail, "Session request rejected");
            store.record_http_status(reply.status);
            store.record_error(
                ErrorKind::BackendRejected,
                format!("session request rejected ({}): {detail}", reply.status),
            );
            self.settle_idle();
            return;
        }

        let Some(item) = reply.item else {
            error!(status = reply.status, "Session reply carried no session");
            store.record_http_status(reply.status);
            store.record_error(
                ErrorKind::EndpointUnresolved,
                format!("session reply ({}) carried no session", reply.status),
            );
            self.settle_idle();
            return;
        };

        info!(session_id = %item.id, status = reply.status, "Session created");
        store.record_session(item.id.clone(), address.clone(), reply.status);

        if self.pending_destroy {
            self.pending_destroy = false;
            self.begin_destroy(item.id, address);
            return;
        }

        if reply.status == 202 {
            self.await_ready(item.id, address);
        } else {
            self.attach(item, store, connector);
        }
    }

    fn settle_idle(&mut self) {
        self.pending_destroy = false;
        self.phase = Phase::Idle;
    }

    /// Poll `address` for `session_id` until it reports ready. The first poll
    /// goes out immediately.
    fn await_ready(&mut self, session_id: String, address: String) {
        self.stop_polling();
        let interval = self.options.polling.session_ready_interval();
        info!(%session_id, interval_ms = interval.as_millis() as u64, "Waiting for session to become ready");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let events = self.events.clone();
        let cycle = self.cycle;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if events.send(DomainEvent::PollTick { cycle }).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.poll = Some(cancel);
        self.poll_attempts = 0;
        self.phase = Phase::AwaitingReady {
            session_id,
            address,
        };
    }

    fn stop_polling(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        self.info_in_flight = false;
    }

    pub fn on_poll_tick(&mut self, cycle: u64, store: &mut TwinStore) {
        let Phase::AwaitingReady {
            session_id,
            address,
        } = &self.phase
        else {
            return;
        };
        if cycle != self.cycle || self.info_in_flight {
            return;
        }
        let (session_id, address) = (session_id.clone(), address.clone());

        self.poll_attempts += 1;
        if let Some(max) = self.options.polling.session_ready_max_attempts {
            if self.poll_attempts > max {
                warn!(%session_id, attempts = max, "Session never became ready");
                store.record_error(
                    ErrorKind::SessionNotReady,
                    format!("session {session_id} not ready after {max} polls"),
                );
                self.begin_destroy(session_id, address);
                return;
            }
        }

        debug!(%session_id, attempt = self.poll_attempts, "Polling session");
        self.info_in_flight = true;
        let service = self.service.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = service.session_info(&address, &session_id).await;
            let _ = events.send(DomainEvent::Http(HttpOutcome::Info {
                cycle,
                session_id,
                result,
            }));
        });
    }

    fn on_info(
        &mut self,
        session_id: String,
        result: anyhow::Result<SessionReply>,
        store: &mut TwinStore,
        connector: &mut TransportConnector,
    ) {
        match result {
            Ok(reply) => {
                store.record_http_status(reply.status);
                match reply.item {
                    Some(item) if reply.status == 200 => {
                        self.stop_polling();
                        self.attach(item, store, connector);
                    }
                    _ => debug!(%session_id, status = reply.status, "Session not ready yet"),
                }
            }
            Err(e) => warn!(%session_id, error = %e, "Session info failed; will retry"),
        }
    }

    fn attach(&mut self, item: StreamItem, store: &mut TwinStore, connector: &mut TransportConnector) {
        match extract_endpoint(&item, self.options.access_token.as_deref()) {
            Ok(endpoint) => {
                info!(session_id = %item.id, endpoint = %endpoint.describe(), "Session ready");
                connector.connect(store, endpoint.clone());
                self.phase = Phase::Attached { endpoint };
            }
            Err(e) => {
                store.record_error(ErrorKind::EndpointUnresolved, e.to_string());
                self.phase = Phase::Idle;
            }
        }
    }

    fn begin_destroy(&mut self, session_id: String, address: String) {
        self.stop_polling();
        self.cycle += 1;
        self.phase = Phase::Destroying;
        info!(%session_id, %address, cycle = self.cycle, "Destroying session");

        let cycle = self.cycle;
        let service = self.service.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = service.destroy_session(&address, &session_id).await;
            let _ = events.send(DomainEvent::Http(HttpOutcome::Destroyed {
                cycle,
                session_id,
                result,
            }));
        });
    }

    fn on_destroyed(
        &mut self,
        session_id: String,
        result: anyhow::Result<DestroyReply>,
        store: &mut TwinStore,
        connector: &mut TransportConnector,
        prober: &mut KitProber,
    ) {
        match result {
            Ok(reply) if reply.is_success() => info!(%session_id, "Session destroyed"),
            Ok(reply) => warn!(
                %session_id,
                status = reply.status,
                detail = reply.detail.as_deref().unwrap_or(""),
                "Destroy failed; clearing local state anyway"
            ),
            Err(e) => warn!(%session_id, error = %e, "Destroy failed; clearing local state anyway"),
        }

        connector.terminate();
        prober.stop();
        store.teardown();
        self.phase = Phase::Idle;

        // The caller may have asked to connect again while we were tearing down.
        let intent = store.intent().clone();
        if intent.wants_session() {
            self.start_request(store, &intent);
        }
    }

    /// The transport of the current connection stopped or terminated.
    pub fn on_transport_ended(&mut self, store: &TwinStore) {
        let Phase::Attached { endpoint } = &self.phase else {
            return;
        };
        if !self.options.reattach_on_stop || !store.intent().wants_session() {
            debug!(endpoint = %endpoint.describe(), "Stream ended; session kept");
            return;
        }
        if let Some(session) = store.session() {
            info!(session_id = %session.session_id, "Stream ended; re-resolving session endpoint");
            self.await_ready(session.session_id.clone(), session.address.clone());
        }
    }

    /// Cancel background polling. Used when the dispatch loop exits.
    pub fn shutdown(&mut self) {
        self.stop_polling();
    }
}
