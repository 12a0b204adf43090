use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, now_iso, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, MailMessage, MailSender};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

const STATUS_PRESENT: &str = "present";
const STATUS_ABSENT: &str = "absent";

fn record_id(batch_id: &str, date: NaiveDate) -> String {
    format!("{}_{}", batch_id, date)
}

/// Parse and validate the studentId -> status map. Ordering is kept stable
/// so the persisted JSON is deterministic.
fn parse_status_map(
    params: &serde_json::Value,
) -> Result<BTreeMap<String, String>, HandlerErr> {
    let Some(obj) = params.get("studentStatus").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing studentStatus"));
    };
    if obj.is_empty() {
        return Err(HandlerErr::bad_params("studentStatus must not be empty"));
    }
    let mut map = BTreeMap::new();
    for (student_id, value) in obj {
        let status = value.as_str().unwrap_or("");
        if status != STATUS_PRESENT && status != STATUS_ABSENT {
            return Err(HandlerErr {
                code: "bad_params",
                message: "status must be present or absent".to_string(),
                details: Some(json!({ "studentId": student_id, "status": value })),
            });
        }
        map.insert(student_id.clone(), status.to_string());
    }
    Ok(map)
}

fn lookup_batch_name(conn: &Connection, batch_id: &str) -> Result<String, HandlerErr> {
    conn.query_row("SELECT name FROM batches WHERE id = ?", [batch_id], |r| {
        r.get(0)
    })
    .optional()
    .map_err(HandlerErr::query)?
    .ok_or_else(|| HandlerErr::not_found("batch not found"))
}

fn active_roster(conn: &Connection, batch_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id FROM students WHERE batch_id = ? AND status = 'active'")
        .map_err(HandlerErr::query)?;
    stmt.query_map([batch_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

/// The submitted map must cover the active roster exactly: a partial sheet
/// or a stray student id is a validation error, not a silent skip.
fn check_roster_coverage(
    roster: &[String],
    statuses: &BTreeMap<String, String>,
) -> Result<(), HandlerErr> {
    let missing: Vec<&String> = roster.iter().filter(|id| !statuses.contains_key(*id)).collect();
    if !missing.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "studentStatus is missing roster members".to_string(),
            details: Some(json!({ "missing": missing })),
        });
    }
    let unknown: Vec<&String> = statuses
        .keys()
        .filter(|id| !roster.contains(id))
        .collect();
    if !unknown.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "studentStatus contains students outside the batch".to_string(),
            details: Some(json!({ "unknown": unknown })),
        });
    }
    Ok(())
}

struct SubmitOutcome {
    record_id: String,
    mirror_count: usize,
    absentees: Vec<String>,
    batch_name: String,
}

/// One-per-day-per-batch submission. The master row insert is conditional on
/// its primary key inside the same transaction as the mirrors, so two
/// racing submissions cannot both commit and no partial state is visible.
fn submit(
    conn: &Connection,
    today: NaiveDate,
    params: &serde_json::Value,
) -> Result<SubmitOutcome, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let teacher_name = get_required_str(params, "teacherName")?;
    let date = crate::ipc::helpers::get_required_date(params, "date")?;
    let statuses = parse_status_map(params)?;

    // Anti-backdating control: only the current server day is accepted, and
    // the rejection happens before the store is touched at all.
    if date != today {
        return Err(HandlerErr {
            code: "date_not_today",
            message: "attendance can only be submitted for the current date".to_string(),
            details: Some(json!({ "date": date.to_string(), "today": today.to_string() })),
        });
    }

    let batch_name = lookup_batch_name(conn, &batch_id)?;
    let roster = active_roster(conn, &batch_id)?;
    check_roster_coverage(&roster, &statuses)?;

    let rec_id = record_id(&batch_id, date);
    let statuses_json =
        serde_json::to_string(&statuses).map_err(|e| HandlerErr {
            code: "internal",
            message: e.to_string(),
            details: None,
        })?;
    let submitted_at = now_iso();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let inserted = tx
        .execute(
            "INSERT INTO attendance_records(id, batch_id, date, statuses, teacher_name, submitted_at)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
            (
                &rec_id,
                &batch_id,
                date.to_string(),
                &statuses_json,
                &teacher_name,
                &submitted_at,
            ),
        )
        .map_err(|e| HandlerErr::insert(e, "attendance_records"))?;
    if inserted == 0 {
        // Day already locked; the transaction is dropped with nothing in it.
        return Err(HandlerErr::conflict(
            "already_submitted",
            "attendance for this batch and date is already submitted",
        ));
    }

    for (student_id, status) in &statuses {
        tx.execute(
            "INSERT INTO student_attendance(student_id, date, batch_id, record_id, status)
             VALUES(?, ?, ?, ?, ?)",
            (student_id, date.to_string(), &batch_id, &rec_id, status),
        )
        .map_err(|e| HandlerErr::insert(e, "student_attendance"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    let absentees = statuses
        .iter()
        .filter(|(_, s)| s.as_str() == STATUS_ABSENT)
        .map(|(id, _)| id.clone())
        .collect();

    Ok(SubmitOutcome {
        record_id: rec_id,
        mirror_count: statuses.len(),
        absentees,
        batch_name,
    })
}

/// Best-effort guardian fan-out. Runs after the attendance writes are
/// durable; every failure is logged and swallowed.
fn notify_guardians(
    conn: &Connection,
    mailer: Arc<dyn MailSender>,
    absentees: &[String],
    batch_name: &str,
    date: &str,
) {
    if absentees.is_empty() {
        return;
    }

    let (subject_tpl, body_tpl) = absence_template(conn);

    // One batched lookup for exactly the absent students.
    let placeholders = vec!["?"; absentees.len()].join(", ");
    let sql = format!(
        "SELECT first_name, last_name, guardian_email
         FROM students
         WHERE id IN ({}) AND guardian_email IS NOT NULL",
        placeholders
    );
    let rows = conn.prepare(&sql).and_then(|mut stmt| {
        stmt.query_map(rusqlite::params_from_iter(absentees.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    });
    let rows = match rows {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "guardian lookup failed; skipping absence notices");
            return;
        }
    };

    let messages: Vec<MailMessage> = rows
        .into_iter()
        .map(|(first, last, email)| {
            let student_name = format!("{} {}", first, last);
            let vars = [
                ("studentName", student_name.as_str()),
                ("date", date),
                ("batchName", batch_name),
            ];
            MailMessage {
                to: email,
                subject: notify::render_template(&subject_tpl, &vars),
                html_body: notify::render_template(&body_tpl, &vars),
            }
        })
        .collect();

    tracing::info!(count = messages.len(), batch = batch_name, "queueing absence notices");
    notify::dispatch_detached(mailer, messages);
}

fn absence_template(conn: &Connection) -> (String, String) {
    match db::settings_get_json(conn, "emailTemplates.absence") {
        Ok(Some(v)) => {
            let subject = v
                .get("subject")
                .and_then(|s| s.as_str())
                .unwrap_or(notify::DEFAULT_ABSENCE_SUBJECT)
                .to_string();
            let body = v
                .get("body")
                .and_then(|s| s.as_str())
                .unwrap_or(notify::DEFAULT_ABSENCE_BODY)
                .to_string();
            (subject, body)
        }
        Ok(None) => (
            notify::DEFAULT_ABSENCE_SUBJECT.to_string(),
            notify::DEFAULT_ABSENCE_BODY.to_string(),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "template lookup failed; using default");
            (
                notify::DEFAULT_ABSENCE_SUBJECT.to_string(),
                notify::DEFAULT_ABSENCE_BODY.to_string(),
            )
        }
    }
}

/// Post-hoc correction. The day stays locked; only the map and the edit
/// metadata change, mirrors included, in one transaction.
fn edit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let edited_by = get_required_str(params, "editedBy")?;
    let date = crate::ipc::helpers::get_required_date(params, "date")?;
    let statuses = parse_status_map(params)?;

    let rec_id = record_id(&batch_id, date);
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_records WHERE id = ?",
            [&rec_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found(
            "no attendance submitted for this batch and date",
        ));
    }

    let roster = active_roster(conn, &batch_id)?;
    check_roster_coverage(&roster, &statuses)?;

    let statuses_json = serde_json::to_string(&statuses).map_err(|e| HandlerErr {
        code: "internal",
        message: e.to_string(),
        details: None,
    })?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "UPDATE attendance_records
         SET statuses = ?, last_edited_by = ?, last_edited_at = ?
         WHERE id = ?",
        (&statuses_json, &edited_by, now_iso(), &rec_id),
    )
    .map_err(|e| HandlerErr::update(e, "attendance_records"))?;
    tx.execute(
        "DELETE FROM student_attendance WHERE record_id = ?",
        [&rec_id],
    )
    .map_err(|e| HandlerErr::update(e, "student_attendance"))?;
    for (student_id, status) in &statuses {
        tx.execute(
            "INSERT INTO student_attendance(student_id, date, batch_id, record_id, status)
             VALUES(?, ?, ?, ?, ?)",
            (student_id, date.to_string(), &batch_id, &rec_id, status),
        )
        .map_err(|e| HandlerErr::insert(e, "student_attendance"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "recordId": rec_id, "edited": true }))
}

fn get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let date = crate::ipc::helpers::get_required_date(params, "date")?;
    let rec_id = record_id(&batch_id, date);

    let record = conn
        .query_row(
            "SELECT statuses, teacher_name, submitted_at, last_edited_by, last_edited_at
             FROM attendance_records WHERE id = ?",
            [&rec_id],
            |r| {
                let statuses_raw: String = r.get(0)?;
                Ok(json!({
                    "recordId": rec_id.clone(),
                    "batchId": batch_id.clone(),
                    "date": date.to_string(),
                    "studentStatus": serde_json::from_str::<serde_json::Value>(&statuses_raw)
                        .unwrap_or_else(|_| json!({})),
                    "teacherName": r.get::<_, String>(1)?,
                    "submittedAt": r.get::<_, String>(2)?,
                    "lastEditedBy": r.get::<_, Option<String>>(3)?,
                    "lastEditedAt": r.get::<_, Option<String>>(4)?,
                }))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;

    match record {
        Some(r) => Ok(json!({ "record": r })),
        None => Ok(json!({ "record": null })),
    }
}

fn for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let from = crate::ipc::helpers::get_optional_date(params, "from")?;
    let to = crate::ipc::helpers::get_optional_date(params, "to")?;

    let mut stmt = conn
        .prepare(
            "SELECT date, batch_id, status
             FROM student_attendance
             WHERE student_id = ?1
               AND (?2 IS NULL OR date >= ?2)
               AND (?3 IS NULL OR date <= ?3)
             ORDER BY date",
        )
        .map_err(HandlerErr::query)?;
    let days = stmt
        .query_map(
            (
                &student_id,
                from.map(|d| d.to_string()),
                to.map(|d| d.to_string()),
            ),
            |r| {
                Ok(json!({
                    "date": r.get::<_, String>(0)?,
                    "batchId": r.get::<_, String>(1)?,
                    "status": r.get::<_, String>(2)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "days": days }))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let today = Local::now().date_naive();
    match submit(conn, today, &req.params) {
        Ok(outcome) => {
            if let Some(mailer) = state.mailer.as_ref() {
                notify_guardians(
                    conn,
                    Arc::clone(mailer),
                    &outcome.absentees,
                    &outcome.batch_name,
                    &today.to_string(),
                );
            }
            ok(
                &req.id,
                json!({
                    "recordId": outcome.record_id,
                    "mirrorCount": outcome.mirror_count,
                    "absentCount": outcome.absentees.len(),
                    "message": "attendance submitted",
                }),
            )
        }
        Err(e) => e.response(&req.id),
    }
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
        "attendance.submit" => Some(handle_submit(state, req)),
        "attendance.edit" => Some(run(edit, state, req)),
        "attendance.get" => Some(run(get, state, req)),
        "attendance.forStudent" => Some(run(for_student, state, req)),
        _ => None,
    }
}
