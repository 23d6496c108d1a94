//! Scene load coordination.
//!
//! The requested URL is local intent; loaded URL and loading state come only
//! from Kit. Functions here mutate the store and return the request to send, if
//! any.

use serde_json::Value;
use tracing::{debug, info, warn};

use kit_twin_core::protocol::KitRequest;
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::ErrorKind;

/// Record a new requested scene and ask Kit to open it when it can.
pub fn request_scene(store: &mut TwinStore, url: String) -> Option<KitRequest> {
    if !store.request_scene(url.clone()) || url.is_empty() {
        return None;
    }
    if !store.is_responsive() {
        debug!(%url, "Kit not responsive; scene recorded only");
        return None;
    }
    store.mark_scene_loading();
    info!(%url, "Requesting stage");
    Some(KitRequest::OpenStageRequest { url })
}

/// Kit finished opening a stage, whether or not this client asked for it.
pub fn on_opened_stage(
    store: &mut TwinStore,
    url: String,
    result: Option<String>,
    error: Option<String>,
) {
    if let Some(error) = error {
        warn!(%url, result = result.as_deref().unwrap_or(""), %error, "Kit failed to open stage");
        store.record_error(ErrorKind::StageOpen, format!("{url}: {error}"));
    } else {
        info!(%url, "Stage opened");
    }
    store.apply_opened_stage(url);
}

pub fn on_progress_amount(store: &mut TwinStore, amount: Value) {
    store.set_progress_amount(amount);
}

pub fn on_progress_activity(store: &mut TwinStore, activity: Value) {
    store.set_progress_activity(activity);
}

/// Ask Kit to reset the camera to the stage's initial view.
pub fn reset_stage(store: &TwinStore) -> Option<KitRequest> {
    if !store.is_responsive() {
        debug!("Kit not responsive; ignoring stage reset");
        return None;
    }
    Some(KitRequest::ResetStage {})
}

pub fn on_reset_response(store: &mut TwinStore, result: String, error: String) {
    if error.is_empty() {
        debug!(%result, "Stage reset");
    } else {
        warn!(%result, %error, "Stage reset failed");
        store.record_error(ErrorKind::StageReset, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kit_twin_core::types::LoadingState;

    fn responsive_store() -> TwinStore {
        let mut store = TwinStore::new();
        let generation = store.begin_connection();
        store.mark_responsive(generation, LoadingState::Idle, String::new());
        store
    }

    #[test]
    fn test_request_sends_when_responsive() {
        let mut store = responsive_store();
        let request = request_scene(&mut store, "/app/a.usd".into());
        assert_eq!(
            request,
            Some(KitRequest::OpenStageRequest {
                url: "/app/a.usd".into()
            })
        );
        assert_eq!(store.scene().loading_state, LoadingState::Loading);

        assert_eq!(request_scene(&mut store, "/app/a.usd".into()), None);
    }

    #[test]
    fn test_request_recorded_when_not_responsive() {
        let mut store = TwinStore::new();
        assert_eq!(request_scene(&mut store, "/app/a.usd".into()), None);
        assert_eq!(store.scene().requested_url, "/app/a.usd");
        assert_eq!(store.scene().loading_state, LoadingState::Idle);
    }

    #[test]
    fn test_empty_request_not_sent() {
        let mut store = responsive_store();
        request_scene(&mut store, "/app/a.usd".into());
        assert_eq!(request_scene(&mut store, String::new()), None);
        assert_eq!(store.scene().requested_url, "");
    }

    #[test]
    fn test_opened_stage_wins_and_records_error() {
        let mut store = responsive_store();
        request_scene(&mut store, "X".into());
        on_progress_amount(&mut store, serde_json::json!({"amount": 0.5}));

        on_opened_stage(&mut store, "Y".into(), Some("error".into()), Some("missing".into()));

        assert_eq!(store.scene().loaded_url, "Y");
        assert_eq!(store.scene().loading_state, LoadingState::Idle);
        assert_eq!(store.last_error().unwrap().kind, ErrorKind::StageOpen);
        assert_eq!(store.snapshot(Default::default()).progress.amount, None);
    }

    #[test]
    fn test_reset_stage() {
        let mut store = TwinStore::new();
        assert_eq!(reset_stage(&store), None);

        let generation = store.begin_connection();
        store.mark_responsive(generation, LoadingState::Idle, String::new());
        assert_eq!(reset_stage(&store), Some(KitRequest::ResetStage {}));

        on_reset_response(&mut store, "error".into(), "no camera".into());
        assert_eq!(store.last_error().unwrap().kind, ErrorKind::StageReset);
    }
}
