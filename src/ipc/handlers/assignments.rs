use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    batch_exists, get_optional_date, get_optional_str, get_required_f64, get_required_str,
    now_iso, student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::Local;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let title = get_required_str(params, "title")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }
    let due_date = get_optional_date(params, "dueDate")?;

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(id, batch_id, subject, title, description,
                                 due_date, attachment_url, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &batch_id,
            get_optional_str(params, "subject"),
            &title,
            get_optional_str(params, "description"),
            due_date.map(|d| d.to_string()),
            get_optional_str(params, "attachmentUrl"),
            now_iso(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "assignments"))?;

    Ok(json!({ "assignmentId": assignment_id }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               a.id, a.subject, a.title, a.description, a.due_date, a.attachment_url,
               a.created_at,
               (SELECT COUNT(*) FROM submissions s WHERE s.assignment_id = a.id)
             FROM assignments a
             WHERE a.batch_id = ?
             ORDER BY a.created_at DESC",
        )
        .map_err(HandlerErr::query)?;
    let assignments = stmt
        .query_map([&batch_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": r.get::<_, Option<String>>(1)?,
                "title": r.get::<_, String>(2)?,
                "description": r.get::<_, Option<String>>(3)?,
                "dueDate": r.get::<_, Option<String>>(4)?,
                "attachmentUrl": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
                "submissionCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "assignments": assignments }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "DELETE FROM submissions WHERE assignment_id = ?",
        [&assignment_id],
    )
    .map_err(|e| HandlerErr::update(e, "submissions"))?;
    let deleted = tx
        .execute("DELETE FROM assignments WHERE id = ?", [&assignment_id])
        .map_err(|e| HandlerErr::update(e, "assignments"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    tx.commit().map_err(HandlerErr::commit)?;
    Ok(json!({ "deleted": true }))
}

/// Student hand-in. Re-submitting replaces the link; the late flag is
/// computed against the assignment's due date at submission time.
fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let link = get_required_str(params, "link")?;

    let due_date: Option<Option<String>> = conn
        .query_row(
            "SELECT due_date FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(due_date) = due_date else {
        return Err(HandlerErr::not_found("assignment not found"));
    };
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let today = Local::now().date_naive().to_string();
    let is_late = matches!(due_date, Some(ref due) if today.as_str() > due.as_str());

    conn.execute(
        "INSERT INTO submissions(assignment_id, student_id, link, submitted_at, is_late)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           link = excluded.link,
           submitted_at = excluded.submitted_at,
           is_late = excluded.is_late",
        (
            &assignment_id,
            &student_id,
            &link,
            now_iso(),
            is_late as i64,
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "submissions"))?;

    Ok(json!({ "assignmentId": assignment_id, "studentId": student_id, "isLate": is_late }))
}

fn list_submissions(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT s.student_id, st.first_name, st.last_name, s.link, s.submitted_at,
                    s.is_late, s.marks, s.feedback, s.graded_at
             FROM submissions s
             JOIN students st ON st.id = s.student_id
             WHERE s.assignment_id = ?
             ORDER BY s.submitted_at",
        )
        .map_err(HandlerErr::query)?;
    let submissions = stmt
        .query_map([&assignment_id], |r| {
            let first: String = r.get(1)?;
            let last: String = r.get(2)?;
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentName": format!("{} {}", first, last),
                "link": r.get::<_, String>(3)?,
                "submittedAt": r.get::<_, String>(4)?,
                "isLate": r.get::<_, i64>(5)? != 0,
                "marks": r.get::<_, Option<f64>>(6)?,
                "feedback": r.get::<_, Option<String>>(7)?,
                "gradedAt": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "submissions": submissions }))
}

fn grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = get_required_str(params, "assignmentId")?;
    let student_id = get_required_str(params, "studentId")?;
    let marks = get_required_f64(params, "marks")?;
    if marks < 0.0 {
        return Err(HandlerErr::bad_params("marks must not be negative"));
    }

    let updated = conn
        .execute(
            "UPDATE submissions SET marks = ?, feedback = ?, graded_at = ?
             WHERE assignment_id = ? AND student_id = ?",
            (
                marks,
                get_optional_str(params, "feedback"),
                now_iso(),
                &assignment_id,
                &student_id,
            ),
        )
        .map_err(|e| HandlerErr::update(e, "submissions"))?;
    if updated == 0 {
        return Err(HandlerErr::not_found("submission not found"));
    }

    Ok(json!({ "assignmentId": assignment_id, "studentId": student_id }))
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
        "assignments.create" => Some(run(create, state, req)),
        "assignments.list" => Some(run(list, state, req)),
        "assignments.delete" => Some(run(delete, state, req)),
        "submissions.submit" => Some(run(submit, state, req)),
        "submissions.list" => Some(run(list_submissions, state, req)),
        "submissions.grade" => Some(run(grade, state, req)),
        _ => None,
    }
}
