//! Twin state container.
//!
//! The store is owned by a single dispatch task. Every write goes through a
//! named operation so the precedence rules between local intent and remote
//! acknowledgments live in one place.

use chrono::Utc;
use tracing::debug;

use crate::types::{
    ErrorKind, KitState, LastError, LifecyclePhase, LoadProgress, LoadingState, RemoteSession,
    SceneLoadState, SelectionOrigin, SelectionState, SessionIntent, Snapshot, StatusEvent,
    TransportEndpoint,
};

#[derive(Debug, Default)]
pub struct TwinStore {
    intent: SessionIntent,
    session: Option<RemoteSession>,
    http_status: u16,
    endpoint: Option<TransportEndpoint>,
    kit_state: KitState,
    generation: u64,
    scene: SceneLoadState,
    selection: SelectionState,
    last_status: Option<StatusEvent>,
    progress: LoadProgress,
    last_error: Option<LastError>,
}

impl TwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intent(&self) -> &SessionIntent {
        &self.intent
    }

    pub fn session(&self) -> Option<&RemoteSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn endpoint(&self) -> Option<&TransportEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn kit_state(&self) -> KitState {
        self.kit_state
    }

    pub fn is_responsive(&self) -> bool {
        self.kit_state == KitState::Responsive
    }

    /// Current transport connection generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn scene(&self) -> &SceneLoadState {
        &self.scene
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn last_status(&self) -> Option<&StatusEvent> {
        self.last_status.as_ref()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    // --- Session intent and backend session ---

    /// Replace the intent. Returns `false` when nothing changed.
    pub fn set_intent(&mut self, intent: SessionIntent) -> bool {
        if self.intent == intent {
            return false;
        }
        self.intent = intent;
        true
    }

    pub fn record_session(
        &mut self,
        session_id: impl Into<String>,
        address: impl Into<String>,
        status: u16,
    ) {
        self.session = Some(RemoteSession {
            session_id: session_id.into(),
            address: address.into(),
            status,
        });
        self.http_status = status;
    }

    /// Last backend status seen, shown alongside the session.
    pub fn record_http_status(&mut self, status: u16) {
        self.http_status = status;
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
    }

    pub fn clear_session(&mut self) {
        self.session = None;
        self.http_status = 0;
    }

    // --- Transport connection ---

    pub fn attach_endpoint(&mut self, endpoint: TransportEndpoint) {
        self.endpoint = Some(endpoint);
    }

    /// Start a new transport connection. Kit is unknown until it answers a probe.
    pub fn begin_connection(&mut self) -> u64 {
        self.generation += 1;
        self.kit_state = KitState::Unknown;
        self.generation
    }

    /// The connection of `generation` stopped or terminated.
    ///
    /// Returns `false` for a stale generation, leaving state untouched.
    pub fn end_connection(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.kit_state = KitState::Unknown;
        self.endpoint = None;
        true
    }

    /// Invalidate whatever connection is current without starting a new one.
    pub fn retire_connection(&mut self) {
        self.generation += 1;
        self.kit_state = KitState::Unknown;
        self.endpoint = None;
    }

    /// Kit answered the readiness probe on `generation`.
    ///
    /// Applies only once per connection; later answers and stale generations
    /// return `false`.
    pub fn mark_responsive(
        &mut self,
        generation: u64,
        loading_state: LoadingState,
        loaded_url: String,
    ) -> bool {
        if generation != self.generation || self.kit_state == KitState::Responsive {
            return false;
        }
        self.kit_state = KitState::Responsive;
        self.scene.loading_state = loading_state;
        self.scene.loaded_url = loaded_url;
        true
    }

    // --- Scene loading ---

    /// Set the scene the user wants. Returns `false` when it is unchanged.
    pub fn request_scene(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        if self.scene.requested_url == url {
            return false;
        }
        self.scene.requested_url = url;
        true
    }

    /// A load request went out and has not been acknowledged yet.
    pub fn mark_scene_loading(&mut self) {
        self.scene.loading_state = LoadingState::Loading;
    }

    /// Kit finished opening a stage. Always wins over local assumptions.
    pub fn apply_opened_stage(&mut self, url: String) {
        debug!(url = %url, requested = %self.scene.requested_url, "Stage opened");
        self.scene.loading_state = LoadingState::Idle;
        self.scene.loaded_url = url;
        self.progress = LoadProgress::default();
    }

    pub fn set_progress_amount(&mut self, amount: serde_json::Value) {
        self.progress.amount = Some(amount);
    }

    pub fn set_progress_activity(&mut self, activity: serde_json::Value) {
        self.progress.activity = Some(activity);
    }

    pub fn reset_scene(&mut self) {
        self.scene = SceneLoadState::default();
        self.progress = LoadProgress::default();
    }

    // --- Selection ---

    /// Add `asset_id` if absent, remove it if present. Client-origin change.
    pub fn toggle_selection(&mut self, asset_id: &str) {
        if !self.selection.asset_ids.shift_remove(asset_id) {
            self.selection.asset_ids.insert(asset_id.to_string());
        }
        self.selection.origin = SelectionOrigin::Client;
    }

    /// Replace the selection from a local source. First occurrence wins on duplicates.
    pub fn set_selection(&mut self, asset_ids: Vec<String>) {
        self.selection.asset_ids = asset_ids.into_iter().collect();
        self.selection.origin = SelectionOrigin::Client;
    }

    /// Replace the selection with what Kit reported.
    pub fn apply_kit_selection(&mut self, prims: Vec<String>) {
        self.selection.asset_ids = prims.into_iter().collect();
        self.selection.origin = SelectionOrigin::Kit;
    }

    pub fn reset_selection_origin(&mut self) {
        self.selection.origin = SelectionOrigin::Client;
    }

    // --- Status ---

    pub fn record_status(&mut self, event: StatusEvent) {
        self.last_status = Some(event);
    }

    // --- Errors ---

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.last_error = Some(LastError {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Drop the backend session and everything derived from it.
    ///
    /// Selection is kept; it belongs to the user, not the session.
    pub fn teardown(&mut self) {
        self.clear_session();
        self.retire_connection();
        self.reset_scene();
    }

    pub fn snapshot(&self, phase: LifecyclePhase) -> Snapshot {
        Snapshot {
            intent: self.intent.clone(),
            phase,
            session: self.session.clone(),
            http_status: self.http_status,
            endpoint: self.endpoint.clone(),
            kit_state: self.kit_state,
            generation: self.generation,
            scene: self.scene.clone(),
            selection: self.selection.clone(),
            last_status: self.last_status.clone(),
            progress: self.progress.clone(),
            last_error: self.last_error.clone(),
        }
    }
}
