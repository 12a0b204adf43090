use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_str, now_iso, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let body = get_required_str(params, "body")?;
    let audience = get_optional_str(params, "audience").unwrap_or_else(|| "all".to_string());
    let expires_on = get_optional_date(params, "expiresOn")?;

    let announcement_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO announcements(id, title, body, audience, created_at, expires_on)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &announcement_id,
            &title,
            &body,
            &audience,
            now_iso(),
            expires_on.map(|d| d.to_string()),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "announcements"))?;

    Ok(json!({ "announcementId": announcement_id }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let today = Local::now().date_naive().to_string();

    let mut stmt = conn
        .prepare(
            "SELECT id, title, body, audience, created_at, expires_on
             FROM announcements
             WHERE ?1 = 0 OR expires_on IS NULL OR expires_on >= ?2
             ORDER BY created_at DESC",
        )
        .map_err(HandlerErr::query)?;
    let announcements = stmt
        .query_map((active_only as i64, &today), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "body": r.get::<_, String>(2)?,
                "audience": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "expiresOn": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "announcements": announcements }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let announcement_id = get_required_str(params, "announcementId")?;
    let deleted = conn
        .execute(
            "DELETE FROM announcements WHERE id = ?",
            [&announcement_id],
        )
        .map_err(|e| HandlerErr::update(e, "announcements"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("announcement not found"));
    }
    Ok(json!({ "deleted": true }))
}

fn event_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let title = get_required_str(params, "title")?;
    let date = get_required_date(params, "date")?;

    let event_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO events(id, title, event_date, venue, description)
         VALUES(?, ?, ?, ?, ?)",
        (
            &event_id,
            &title,
            date.to_string(),
            get_optional_str(params, "venue"),
            get_optional_str(params, "description"),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "events"))?;

    Ok(json!({ "eventId": event_id }))
}

fn event_list(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, event_date, venue, description
             FROM events ORDER BY event_date",
        )
        .map_err(HandlerErr::query)?;
    let events = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "venue": r.get::<_, Option<String>>(3)?,
                "description": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "events": events }))
}

fn event_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let event_id = get_required_str(params, "eventId")?;
    let deleted = conn
        .execute("DELETE FROM events WHERE id = ?", [&event_id])
        .map_err(|e| HandlerErr::update(e, "events"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("event not found"));
    }
    Ok(json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
               state: &mut AppState,
               req: &Request| {
        let Some(conn) = state.db.as_ref() else {
            return err(&req.id, "no_workspace", "select a workspace first", None);
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "announcements.create" => Some(run(create, state, req)),
        "announcements.list" => Some(run(list, state, req)),
        "announcements.delete" => Some(run(delete, state, req)),
        "events.create" => Some(run(event_create, state, req)),
        "events.list" => Some(run(event_list, state, req)),
        "events.delete" => Some(run(event_delete, state, req)),
        _ => None,
    }
}
