use crate::ipc::error::{err, ok};
use crate::ipc::handlers::session::{create_user, generate_credentials};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_subjects_json, subjects_value, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let subjects = get_subjects_json(params, "subjects")?.unwrap_or_else(|| "[]".to_string());
    let teacher_id = Uuid::new_v4().to_string();

    let (first, last) = match name.split_once(' ') {
        Some((f, l)) => (f.to_string(), l.replace(' ', ".")),
        None => (name.clone(), "staff".to_string()),
    };
    let creds = generate_credentials(&first, &last);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "INSERT INTO teachers(id, name, email, phone, subjects, joined_on)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &name,
            get_optional_str(params, "email"),
            get_optional_str(params, "phone"),
            &subjects,
            get_optional_str(params, "joinedOn"),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "teachers"))?;
    create_user(&tx, &creds.user_name, &creds.password, "teacher", &teacher_id)?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "teacherId": teacher_id,
        "userName": creds.user_name,
        "password": creds.password,
    }))
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, email, phone, subjects, joined_on,
                    (SELECT COUNT(*) FROM batches b WHERE b.teacher_id = t.id)
             FROM teachers t
             ORDER BY name",
        )
        .map_err(HandlerErr::query)?;
    let teachers = stmt
        .query_map([], |r| {
            let subjects_raw: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, Option<String>>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "subjects": subjects_value(&subjects_raw),
                "joinedOn": r.get::<_, Option<String>>(5)?,
                "batchCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "teachers": teachers }))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    if !teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    for (key, column) in [
        ("name", "name"),
        ("email", "email"),
        ("phone", "phone"),
        ("joinedOn", "joined_on"),
    ] {
        if let Some(value) = get_optional_str(patch, key) {
            let sql = format!("UPDATE teachers SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, &teacher_id))
                .map_err(|e| HandlerErr::update(e, "teachers"))?;
        }
    }
    if let Some(subjects) = get_subjects_json(patch, "subjects")? {
        conn.execute(
            "UPDATE teachers SET subjects = ? WHERE id = ?",
            (&subjects, &teacher_id),
        )
        .map_err(|e| HandlerErr::update(e, "teachers"))?;
    }
    Ok(json!({ "teacherId": teacher_id }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    if !teacher_exists(conn, &teacher_id)? {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let assigned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM batches WHERE teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;
    if assigned > 0 {
        return Err(HandlerErr {
            code: "conflict",
            message: "teacher is assigned to batches".to_string(),
            details: Some(json!({ "batchCount": assigned })),
        });
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute("DELETE FROM payroll WHERE teacher_id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::update(e, "payroll"))?;
    tx.execute("DELETE FROM users WHERE person_id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::update(e, "users"))?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id])
        .map_err(|e| HandlerErr::update(e, "teachers"))?;
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
        "teachers.create" => Some(run(create, state, req)),
        "teachers.list" => Some(run(list, state, req)),
        "teachers.update" => Some(run(update, state, req)),
        "teachers.delete" => Some(run(delete, state, req)),
        _ => None,
    }
}
