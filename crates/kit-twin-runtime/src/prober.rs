//! Kit readiness prober.
//!
//! After the transport starts, Kit may still be booting. The prober sends
//! `loadingStateQuery` on a fixed cadence until Kit answers with
//! `loadingStateResponse`, at which point it marks Kit responsive.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kit_twin_core::config::PollingConfig;
use kit_twin_core::protocol::KitRequest;
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::{ErrorKind, LoadingState};

use crate::events::DomainEvent;

struct ActiveProbe {
    generation: u64,
    cancel: CancellationToken,
    attempts: u32,
}

/// Single-flight probe loop bound to a connection generation.
///
/// A ticker task posts [`DomainEvent::ProbeTick`]; the dispatch loop answers
/// each tick through [`KitProber::on_tick`], which decides whether to send.
pub struct KitProber {
    interval: Duration,
    max_attempts: Option<u32>,
    active: Option<ActiveProbe>,
}

impl KitProber {
    pub fn new(polling: &PollingConfig) -> Self {
        Self {
            interval: polling.kit_probe_interval(),
            max_attempts: polling.kit_probe_max_attempts,
            active: None,
        }
    }

    /// Generation currently being probed.
    pub fn probing(&self) -> Option<u64> {
        self.active.as_ref().map(|p| p.generation)
    }

    /// Start probing `generation`. A second start for the same generation is a
    /// no-op; a start for a new generation replaces the old loop.
    pub fn start(&mut self, generation: u64, events: &mpsc::UnboundedSender<DomainEvent>) -> bool {
        if self.probing() == Some(generation) {
            return false;
        }
        self.stop();

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let events = events.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if events.send(DomainEvent::ProbeTick { generation }).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(generation, "Probe loop finished");
        });

        debug!(generation, interval_ms = interval.as_millis() as u64, "Probing kit");
        self.active = Some(ActiveProbe {
            generation,
            cancel,
            attempts: 0,
        });
        true
    }

    pub fn stop(&mut self) {
        if let Some(probe) = self.active.take() {
            probe.cancel.cancel();
        }
    }

    /// Handle a tick. Returns the query to send, or `None` when the tick is
    /// stale or probing is over.
    pub fn on_tick(&mut self, generation: u64, store: &mut TwinStore) -> Option<KitRequest> {
        let probe = self.active.as_mut().filter(|p| p.generation == generation)?;

        if store.generation() != generation || store.is_responsive() {
            self.stop();
            return None;
        }

        probe.attempts += 1;
        if let Some(max) = self.max_attempts {
            if probe.attempts > max {
                warn!(generation, attempts = max, "Kit did not answer readiness probe");
                store.record_error(
                    ErrorKind::KitUnresponsive,
                    format!("kit did not answer {max} readiness probes"),
                );
                self.stop();
                return None;
            }
        }

        Some(KitRequest::LoadingStateQuery {})
    }

    /// Kit answered a probe on `generation`. Returns `true` if this answer made
    /// Kit responsive.
    pub fn on_response(
        &mut self,
        generation: u64,
        store: &mut TwinStore,
        loading_state: LoadingState,
        url: String,
    ) -> bool {
        let applied = store.mark_responsive(generation, loading_state, url);
        if applied {
            info!(generation, ?loading_state, url = %store.scene().loaded_url, "Kit is responsive");
        }
        if store.is_responsive() && self.probing() == Some(generation) {
            self.stop();
        }
        applied
    }
}

impl Drop for KitProber {
    fn drop(&mut self) {
        self.stop();
    }
}
