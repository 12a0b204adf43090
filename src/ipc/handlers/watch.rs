use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::watch::ChangeBus;
use serde_json::json;

fn handle_subscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(collection) = req.params.get("collection").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing collection", None);
    };
    if !ChangeBus::is_known_collection(collection) {
        return err(
            &req.id,
            "bad_params",
            format!("unknown collection: {}", collection),
            None,
        );
    }
    let subscription_id = state.bus.subscribe(collection);
    ok(&req.id, json!({ "subscriptionId": subscription_id }))
}

fn handle_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(id) = req.params.get("subscriptionId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing subscriptionId", None);
    };
    match state.bus.poll(id) {
        Some(events) => ok(&req.id, json!({ "events": events })),
        None => err(&req.id, "not_found", "subscription not found", None),
    }
}

fn handle_unsubscribe(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(id) = req.params.get("subscriptionId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing subscriptionId", None);
    };
    if !state.bus.unsubscribe(id) {
        return err(&req.id, "not_found", "subscription not found", None);
    }
    ok(&req.id, json!({ "unsubscribed": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "watch.subscribe" => Some(handle_subscribe(state, req)),
        "watch.poll" => Some(handle_poll(state, req)),
        "watch.unsubscribe" => Some(handle_unsubscribe(state, req)),
        _ => None,
    }
}
