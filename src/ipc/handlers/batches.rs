use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    batch_exists, get_optional_str, get_required_str, get_subjects_json, subjects_value,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const BATCH_STATUSES: &[&str] = &["upcoming", "active", "full", "completed"];

fn validate_status(status: &str) -> Result<(), HandlerErr> {
    if BATCH_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "status must be one of: upcoming, active, full, completed".to_string(),
        details: Some(json!({ "status": status })),
    })
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let status = get_optional_str(params, "status").unwrap_or_else(|| "upcoming".to_string());
    validate_status(&status)?;
    let teacher_id = get_optional_str(params, "teacherId");
    if let Some(ref tid) = teacher_id {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [tid], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::query)?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("teacher not found"));
        }
    }
    let capacity = params.get("capacity").and_then(|v| v.as_i64());
    if matches!(capacity, Some(c) if c <= 0) {
        return Err(HandlerErr::bad_params("capacity must be positive"));
    }
    let subjects = get_subjects_json(params, "subjects")?.unwrap_or_else(|| "[]".to_string());

    let batch_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO batches(id, name, teacher_id, subjects, capacity, status)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&batch_id, &name, &teacher_id, &subjects, capacity, &status),
    )
    .map_err(|e| HandlerErr::insert(e, "batches"))?;

    Ok(json!({ "batchId": batch_id, "name": name }))
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries keep the counts join-free.
    let mut stmt = conn
        .prepare(
            "SELECT
               b.id,
               b.name,
               b.teacher_id,
               b.subjects,
               b.capacity,
               b.status,
               (SELECT COUNT(*) FROM students s WHERE s.batch_id = b.id) AS student_count,
               (SELECT COUNT(*) FROM students s
                WHERE s.batch_id = b.id AND s.status = 'active') AS active_count
             FROM batches b
             ORDER BY b.name",
        )
        .map_err(HandlerErr::query)?;
    let batches = stmt
        .query_map([], |r| {
            let subjects_raw: String = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
                "subjects": subjects_value(&subjects_raw),
                "capacity": r.get::<_, Option<i64>>(4)?,
                "status": r.get::<_, String>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
                "activeCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "batches": batches }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let batch = conn
        .query_row(
            "SELECT id, name, teacher_id, subjects, capacity, status
             FROM batches WHERE id = ?",
            [&batch_id],
            |r| {
                let subjects_raw: String = r.get(3)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "teacherId": r.get::<_, Option<String>>(2)?,
                    "subjects": subjects_value(&subjects_raw),
                    "capacity": r.get::<_, Option<i64>>(4)?,
                    "status": r.get::<_, String>(5)?,
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("batch not found"))?;
    Ok(json!({ "batch": batch }))
}

/// Renames touch exactly one row: every other collection references the
/// batch by id.
fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }

    if let Some(name) = get_optional_str(patch, "name") {
        conn.execute(
            "UPDATE batches SET name = ? WHERE id = ?",
            (&name, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "batches"))?;
    }
    if let Some(status) = get_optional_str(patch, "status") {
        validate_status(&status)?;
        conn.execute(
            "UPDATE batches SET status = ? WHERE id = ?",
            (&status, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "batches"))?;
    }
    if patch.get("teacherId").is_some() {
        let teacher_id = get_optional_str(patch, "teacherId");
        conn.execute(
            "UPDATE batches SET teacher_id = ? WHERE id = ?",
            (&teacher_id, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "batches"))?;
    }
    if let Some(capacity) = patch.get("capacity").and_then(|v| v.as_i64()) {
        if capacity <= 0 {
            return Err(HandlerErr::bad_params("capacity must be positive"));
        }
        conn.execute(
            "UPDATE batches SET capacity = ? WHERE id = ?",
            (capacity, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "batches"))?;
    }
    if let Some(subjects) = get_subjects_json(patch, "subjects")? {
        conn.execute(
            "UPDATE batches SET subjects = ? WHERE id = ?",
            (&subjects, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "batches"))?;
    }

    Ok(json!({ "batchId": batch_id }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }
    let students: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE batch_id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if students > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "batch still has students assigned".to_string(),
            details: Some(json!({ "studentCount": students })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for sql in [
        "DELETE FROM fee_plan_installments WHERE plan_id IN
           (SELECT id FROM fee_plans WHERE batch_id = ?)",
        "DELETE FROM fee_plans WHERE batch_id = ?",
        "DELETE FROM batches WHERE id = ?",
    ] {
        tx.execute(sql, [&batch_id])
            .map_err(|e| HandlerErr::update(e, "batches"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "deleted": true }))
}

fn roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, first_name, last_name, status
             FROM students
             WHERE batch_id = ?
             ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&batch_id], |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "status": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "students": students }))
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
        "batches.create" => Some(run(create, state, req)),
        "batches.list" => Some(run(list, state, req)),
        "batches.get" => Some(run(get, state, req)),
        "batches.update" => Some(run(update, state, req)),
        "batches.delete" => Some(run(delete, state, req)),
        "batches.roster" => Some(run(roster, state, req)),
        _ => None,
    }
}
