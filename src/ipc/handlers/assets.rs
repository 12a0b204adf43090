use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Hand the client what it needs to talk to the image host directly.
/// Uploads never pass through the daemon.
fn handle_upload_config(state: &mut AppState, req: &Request) -> serde_json::Value {
    match (
        state.config.image_host_account.as_ref(),
        state.config.image_host_upload_preset.as_ref(),
    ) {
        (Some(account), Some(preset)) => ok(
            &req.id,
            json!({
                "accountId": account,
                "uploadPreset": preset,
            }),
        ),
        _ => err(
            &req.id,
            "not_configured",
            "image host is not configured; set TUTORD_IMAGE_HOST_ID and TUTORD_IMAGE_UPLOAD_PRESET",
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assets.uploadConfig" => Some(handle_upload_config(state, req)),
        _ => None,
    }
}
