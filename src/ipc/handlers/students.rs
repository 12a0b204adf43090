use crate::ipc::error::{err, ok};
use crate::ipc::handlers::session::{create_user, generate_credentials};
use crate::ipc::helpers::{
    batch_exists, get_optional_str, get_required_date, get_required_str, get_subjects_json,
    now_iso, subjects_value, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const STUDENT_STATUSES: &[&str] = &["active", "on_hold", "graduated", "dropped_out"];

fn validate_status(status: &str) -> Result<(), HandlerErr> {
    if STUDENT_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(HandlerErr {
        code: "bad_params",
        message: "status must be one of: active, on_hold, graduated, dropped_out".to_string(),
        details: Some(json!({ "status": status })),
    })
}

fn check_batch_capacity(conn: &Connection, batch_id: &str) -> Result<(), HandlerErr> {
    let row: Option<(Option<i64>, i64)> = conn
        .query_row(
            "SELECT b.capacity,
                    (SELECT COUNT(*) FROM students s
                     WHERE s.batch_id = b.id AND s.status = 'active')
             FROM batches b WHERE b.id = ?",
            [batch_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((capacity, enrolled)) = row else {
        return Err(HandlerErr::not_found("batch not found"));
    };
    if let Some(cap) = capacity {
        if enrolled >= cap {
            return Err(HandlerErr {
                code: "batch_full",
                message: "batch is at capacity".to_string(),
                details: Some(json!({ "capacity": cap, "enrolled": enrolled })),
            });
        }
    }
    Ok(())
}

fn enroll(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let admission_date = get_required_date(params, "admissionDate")?;
    let batch_id = get_optional_str(params, "batchId");
    if let Some(ref bid) = batch_id {
        if !batch_exists(conn, bid)? {
            return Err(HandlerErr::not_found("batch not found"));
        }
        check_batch_capacity(conn, bid)?;
    }
    let subjects = get_subjects_json(params, "subjects")?.unwrap_or_else(|| "[]".to_string());

    let student_id = Uuid::new_v4().to_string();
    let creds = generate_credentials(&first_name, &last_name);
    let now = now_iso();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "INSERT INTO students(id, first_name, last_name, batch_id, status,
                              guardian_name, guardian_email, guardian_phone,
                              subjects, admission_date, created_at, updated_at)
         VALUES(?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &first_name,
            &last_name,
            &batch_id,
            get_optional_str(params, "guardianName"),
            get_optional_str(params, "guardianEmail"),
            get_optional_str(params, "guardianPhone"),
            &subjects,
            admission_date.to_string(),
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "students"))?;
    create_user(&tx, &creds.user_name, &creds.password, "student", &student_id)?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "studentId": student_id,
        "userName": creds.user_name,
        "password": creds.password,
    }))
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let subjects_raw: String = r.get(8)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "firstName": r.get::<_, String>(1)?,
        "lastName": r.get::<_, String>(2)?,
        "batchId": r.get::<_, Option<String>>(3)?,
        "status": r.get::<_, String>(4)?,
        "guardianName": r.get::<_, Option<String>>(5)?,
        "guardianEmail": r.get::<_, Option<String>>(6)?,
        "guardianPhone": r.get::<_, Option<String>>(7)?,
        "subjects": subjects_value(&subjects_raw),
        "admissionDate": r.get::<_, String>(9)?,
    }))
}

const STUDENT_COLUMNS: &str = "id, first_name, last_name, batch_id, status,
    guardian_name, guardian_email, guardian_phone, subjects, admission_date";

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_optional_str(params, "batchId");
    let status = get_optional_str(params, "status");
    if let Some(ref s) = status {
        validate_status(s)?;
    }

    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR batch_id = ?1)
           AND (?2 IS NULL OR status = ?2)
         ORDER BY last_name, first_name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let students = stmt
        .query_map((&batch_id, &status), |r| student_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "students": students }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    let student = conn
        .query_row(&sql, [&student_id], |r| student_row_json(r))
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({ "student": student }))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if !crate::ipc::helpers::student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    if let Some(status) = get_optional_str(patch, "status") {
        validate_status(&status)?;
        conn.execute(
            "UPDATE students SET status = ? WHERE id = ?",
            (&status, &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "students"))?;
    }
    if patch.get("batchId").is_some() {
        let batch_id = get_optional_str(patch, "batchId");
        if let Some(ref bid) = batch_id {
            if !batch_exists(conn, bid)? {
                return Err(HandlerErr::not_found("batch not found"));
            }
            check_batch_capacity(conn, bid)?;
        }
        conn.execute(
            "UPDATE students SET batch_id = ? WHERE id = ?",
            (&batch_id, &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "students"))?;
    }
    for (key, column) in [
        ("firstName", "first_name"),
        ("lastName", "last_name"),
        ("guardianName", "guardian_name"),
        ("guardianEmail", "guardian_email"),
        ("guardianPhone", "guardian_phone"),
    ] {
        if let Some(value) = get_optional_str(patch, key) {
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, &student_id))
                .map_err(|e| HandlerErr::update(e, "students"))?;
        }
    }
    if let Some(subjects) = get_subjects_json(patch, "subjects")? {
        conn.execute(
            "UPDATE students SET subjects = ? WHERE id = ?",
            (&subjects, &student_id),
        )
        .map_err(|e| HandlerErr::update(e, "students"))?;
    }
    conn.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (now_iso(), &student_id),
    )
    .map_err(|e| HandlerErr::update(e, "students"))?;

    Ok(json!({ "studentId": student_id }))
}

/// Explicit admin delete: removes the student with every dependent row in
/// one transaction. Nothing else in the system hard-deletes students.
fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !crate::ipc::helpers::student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for sql in [
        "DELETE FROM receipts WHERE student_id = ?",
        "DELETE FROM student_installments WHERE student_id = ?",
        "DELETE FROM student_fees WHERE student_id = ?",
        "DELETE FROM student_attendance WHERE student_id = ?",
        "DELETE FROM grades WHERE student_id = ?",
        "DELETE FROM submissions WHERE student_id = ?",
        "DELETE FROM users WHERE person_id = ?",
        "DELETE FROM students WHERE id = ?",
    ] {
        tx.execute(sql, [&student_id])
            .map_err(|e| HandlerErr::update(e, "students"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

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
        "students.enroll" => Some(run(enroll, state, req)),
        "students.list" => Some(run(list, state, req)),
        "students.get" => Some(run(get, state, req)),
        "students.update" => Some(run(update, state, req)),
        "students.delete" => Some(run(delete, state, req)),
        _ => None,
    }
}
