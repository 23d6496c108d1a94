//! Selection and asset-status synchronization.

use tracing::debug;

use kit_twin_core::protocol::KitRequest;
use kit_twin_core::store::TwinStore;
use kit_twin_core::types::{SelectionOrigin, StatusEvent};

/// Selection request for a local change, unless Kit produced it or Kit is not
/// listening yet.
fn local_change(store: &TwinStore) -> Option<KitRequest> {
    if !store.is_responsive() || store.selection().origin == SelectionOrigin::Kit {
        return None;
    }
    Some(KitRequest::SelectPrimsRequest {
        paths: store.selection().paths(),
    })
}

pub fn toggle(store: &mut TwinStore, asset_id: &str) -> Option<KitRequest> {
    store.toggle_selection(asset_id);
    local_change(store)
}

pub fn replace(store: &mut TwinStore, asset_ids: Vec<String>) -> Option<KitRequest> {
    store.set_selection(asset_ids);
    local_change(store)
}

/// Adopt Kit's selection. Nothing is sent back.
pub fn on_kit_selection(store: &mut TwinStore, prims: Vec<String>) {
    debug!(count = prims.len(), "Kit selection changed");
    store.apply_kit_selection(prims);
}

/// Retain `event` as the latest status and forward it if Kit is listening.
pub fn publish_status(store: &mut TwinStore, event: StatusEvent) -> Option<KitRequest> {
    let request = KitRequest::SetStatusRequest {
        asset_id: event.asset_id.clone(),
        asset_status: event.asset_status,
    };
    store.record_status(event);
    store.is_responsive().then_some(request)
}
