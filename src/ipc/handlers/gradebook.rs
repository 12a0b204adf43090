use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    batch_exists, get_optional_str, get_required_str, now_iso, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct AssessmentRow {
    batch_id: String,
    total_marks: f64,
    is_published: bool,
}

fn load_assessment(conn: &Connection, assessment_id: &str) -> Result<AssessmentRow, HandlerErr> {
    conn.query_row(
        "SELECT batch_id, total_marks, is_published FROM assessments WHERE id = ?",
        [assessment_id],
        |r| {
            Ok(AssessmentRow {
                batch_id: r.get(0)?,
                total_marks: r.get(1)?,
                is_published: r.get::<_, i64>(2)? != 0,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("assessment not found"))
}

fn published_guard(assessment: &AssessmentRow) -> Result<(), HandlerErr> {
    if assessment.is_published {
        return Err(HandlerErr::conflict(
            "already_published",
            "assessment is published and read-only",
        ));
    }
    Ok(())
}

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let subject = get_required_str(params, "subject")?;
    let title = get_required_str(params, "title")?;
    let total_marks = crate::ipc::helpers::get_required_f64(params, "totalMarks")?;
    if total_marks <= 0.0 {
        return Err(HandlerErr::bad_params("totalMarks must be positive"));
    }
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }

    let assessment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessments(id, batch_id, subject, title, total_marks,
                                 assessment_date, is_published)
         VALUES(?, ?, ?, ?, ?, ?, 0)",
        (
            &assessment_id,
            &batch_id,
            &subject,
            &title,
            total_marks,
            get_optional_str(params, "assessmentDate"),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "assessments"))?;

    Ok(json!({ "assessmentId": assessment_id }))
}

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let mut stmt = conn
        .prepare(
            "SELECT
               a.id, a.subject, a.title, a.total_marks, a.assessment_date,
               a.is_published, a.published_at,
               (SELECT COUNT(*) FROM grades g WHERE g.assessment_id = a.id) AS graded_count
             FROM assessments a
             WHERE a.batch_id = ?
             ORDER BY a.assessment_date, a.title",
        )
        .map_err(HandlerErr::query)?;
    let assessments = stmt
        .query_map([&batch_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "totalMarks": r.get::<_, f64>(3)?,
                "assessmentDate": r.get::<_, Option<String>>(4)?,
                "isPublished": r.get::<_, i64>(5)? != 0,
                "publishedAt": r.get::<_, Option<String>>(6)?,
                "gradedCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "assessments": assessments }))
}

fn update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing patch"));
    };
    let assessment = load_assessment(conn, &assessment_id)?;
    published_guard(&assessment)?;

    for (key, column) in [
        ("title", "title"),
        ("subject", "subject"),
        ("assessmentDate", "assessment_date"),
    ] {
        if let Some(value) = get_optional_str(patch, key) {
            let sql = format!("UPDATE assessments SET {} = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, &assessment_id))
                .map_err(|e| HandlerErr::update(e, "assessments"))?;
        }
    }
    if let Some(total_marks) = patch.get("totalMarks").and_then(|v| v.as_f64()) {
        if total_marks <= 0.0 {
            return Err(HandlerErr::bad_params("totalMarks must be positive"));
        }
        conn.execute(
            "UPDATE assessments SET total_marks = ? WHERE id = ?",
            (total_marks, &assessment_id),
        )
        .map_err(|e| HandlerErr::update(e, "assessments"))?;
    }

    Ok(json!({ "assessmentId": assessment_id }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let assessment = load_assessment(conn, &assessment_id)?;
    published_guard(&assessment)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute("DELETE FROM grades WHERE assessment_id = ?", [&assessment_id])
        .map_err(|e| HandlerErr::update(e, "grades"))?;
    tx.execute("DELETE FROM assessments WHERE id = ?", [&assessment_id])
        .map_err(|e| HandlerErr::update(e, "assessments"))?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "deleted": true }))
}

/// Parse and validate a studentId -> {score, link} entries object against
/// the assessment's batch roster and mark ceiling.
fn parse_entries(
    conn: &Connection,
    assessment: &AssessmentRow,
    params: &serde_json::Value,
) -> Result<Vec<(String, f64, Option<String>)>, HandlerErr> {
    let Some(obj) = params.get("entries").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut out = Vec::with_capacity(obj.len());
    for (student_id, entry) in obj {
        let score = entry.get("score").and_then(|v| v.as_f64()).ok_or_else(|| {
            HandlerErr {
                code: "bad_params",
                message: "entry is missing a numeric score".to_string(),
                details: Some(json!({ "studentId": student_id })),
            }
        })?;
        if score < 0.0 || score > assessment.total_marks {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("score must be between 0 and {}", assessment.total_marks),
                details: Some(json!({ "studentId": student_id, "score": score })),
            });
        }
        let in_batch: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND batch_id = ?",
                (student_id, &assessment.batch_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if in_batch.is_none() {
            return Err(HandlerErr {
                code: "bad_params",
                message: "student is not in the assessment's batch".to_string(),
                details: Some(json!({ "studentId": student_id })),
            });
        }
        let link = entry
            .get("link")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        out.push((student_id.clone(), score, link));
    }
    Ok(out)
}

fn merge_entries(
    tx: &Connection,
    assessment_id: &str,
    entries: &[(String, f64, Option<String>)],
) -> Result<(), HandlerErr> {
    for (student_id, score, link) in entries {
        tx.execute(
            "INSERT INTO grades(assessment_id, student_id, score, link)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(assessment_id, student_id) DO UPDATE SET
               score = excluded.score,
               link = excluded.link",
            (assessment_id, student_id, score, link),
        )
        .map_err(|e| HandlerErr::insert(e, "grades"))?;
    }
    Ok(())
}

/// Draft save: merge only, never touches visibility.
fn save_draft(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let assessment = load_assessment(conn, &assessment_id)?;
    published_guard(&assessment)?;
    let entries = parse_entries(conn, &assessment, params)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    merge_entries(&tx, &assessment_id, &entries)?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "assessmentId": assessment_id, "savedCount": entries.len() }))
}

/// Publish: an optional final merge plus the visibility flip, atomically.
/// There is no un-publish and no partial publish across students.
fn publish(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let assessment = load_assessment(conn, &assessment_id)?;
    published_guard(&assessment)?;
    let entries = match params.get("entries") {
        Some(_) => parse_entries(conn, &assessment, params)?,
        None => Vec::new(),
    };

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    merge_entries(&tx, &assessment_id, &entries)?;
    tx.execute(
        "UPDATE assessments SET is_published = 1, published_at = ? WHERE id = ?",
        (now_iso(), &assessment_id),
    )
    .map_err(|e| HandlerErr::update(e, "assessments"))?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "assessmentId": assessment_id, "published": true }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let assessment_id = get_required_str(params, "assessmentId")?;
    let assessment = load_assessment(conn, &assessment_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, score, link FROM grades
             WHERE assessment_id = ? ORDER BY student_id",
        )
        .map_err(HandlerErr::query)?;
    let mut entries = serde_json::Map::new();
    let rows = stmt
        .query_map([&assessment_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, Option<String>>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    for (student_id, score, link) in rows {
        entries.insert(student_id, json!({ "score": score, "link": link }));
    }

    Ok(json!({
        "assessmentId": assessment_id,
        "isPublished": assessment.is_published,
        "totalMarks": assessment.total_marks,
        "entries": entries,
    }))
}

/// Student-facing results: published assessments only.
fn results_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.subject, a.title, a.total_marks, a.assessment_date,
                    g.score, g.link
             FROM grades g
             JOIN assessments a ON a.id = g.assessment_id
             WHERE g.student_id = ? AND a.is_published = 1
             ORDER BY a.assessment_date, a.title",
        )
        .map_err(HandlerErr::query)?;
    let results = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "assessmentId": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "totalMarks": r.get::<_, f64>(3)?,
                "assessmentDate": r.get::<_, Option<String>>(4)?,
                "score": r.get::<_, f64>(5)?,
                "link": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "results": results }))
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
        "assessments.create" => Some(run(create, state, req)),
        "assessments.list" => Some(run(list, state, req)),
        "assessments.update" => Some(run(update, state, req)),
        "assessments.delete" => Some(run(delete, state, req)),
        "grades.saveDraft" => Some(run(save_draft, state, req)),
        "grades.publish" => Some(run(publish, state, req)),
        "grades.get" => Some(run(get, state, req)),
        "results.forStudent" => Some(run(results_for_student, state, req)),
        _ => None,
    }
}
