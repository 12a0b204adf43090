use crate::db;
use crate::fees::{generate_installments, resolve_due_date, validate_plan, PlanTemplate};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    batch_exists, get_optional_str, get_required_str, now_iso, student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, MailMessage, MailSender};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn parse_plan_template(plan: &serde_json::Value) -> Result<PlanTemplate, HandlerErr> {
    let template: PlanTemplate =
        serde_json::from_value(plan.clone()).map_err(|e| HandlerErr {
            code: "bad_params",
            message: format!("invalid plan template: {}", e),
            details: None,
        })?;
    validate_plan(&template).map_err(HandlerErr::bad_params)?;
    Ok(template)
}

fn save_plan(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }
    let Some(plan) = params.get("plan").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("missing plan"));
    };
    let name = get_required_str(plan, "name")?;
    let template = parse_plan_template(plan)?;
    let installments = generate_installments(&template);
    let params_json = serde_json::to_string(&template).map_err(|e| HandlerErr {
        code: "internal",
        message: e.to_string(),
        details: None,
    })?;
    let plan_type = plan
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let plan_id = match get_optional_str(plan, "planId") {
        Some(existing) => {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM fee_plans WHERE id = ? AND batch_id = ?",
                    (&existing, &batch_id),
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::query)?;
            if found.is_none() {
                return Err(HandlerErr::not_found("plan not found"));
            }
            existing
        }
        None => Uuid::new_v4().to_string(),
    };

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "INSERT INTO fee_plans(id, batch_id, name, plan_type, params)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           plan_type = excluded.plan_type,
           params = excluded.params",
        (&plan_id, &batch_id, &name, &plan_type, &params_json),
    )
    .map_err(|e| HandlerErr::insert(e, "fee_plans"))?;
    tx.execute(
        "DELETE FROM fee_plan_installments WHERE plan_id = ?",
        [&plan_id],
    )
    .map_err(|e| HandlerErr::update(e, "fee_plan_installments"))?;
    for (seq, inst) in installments.iter().enumerate() {
        tx.execute(
            "INSERT INTO fee_plan_installments(plan_id, seq, description, amount, offset_months)
             VALUES(?, ?, ?, ?, ?)",
            (
                &plan_id,
                seq as i64,
                &inst.description,
                inst.amount,
                inst.offset_months,
            ),
        )
        .map_err(|e| HandlerErr::insert(e, "fee_plan_installments"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "planId": plan_id,
        "installmentCount": installments.len(),
    }))
}

fn plan_installments_json(
    conn: &Connection,
    plan_id: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT description, amount, offset_months
             FROM fee_plan_installments
             WHERE plan_id = ?
             ORDER BY seq",
        )
        .map_err(HandlerErr::query)?;
    stmt.query_map([plan_id], |r| {
        Ok(json!({
            "description": r.get::<_, String>(0)?,
            "amount": r.get::<_, f64>(1)?,
            "offsetMonths": r.get::<_, i64>(2)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query)
}

fn get_structure(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    if !batch_exists(conn, &batch_id)? {
        return Err(HandlerErr::not_found("batch not found"));
    }
    let mut stmt = conn
        .prepare(
            "SELECT id, name, plan_type, params FROM fee_plans
             WHERE batch_id = ? ORDER BY name",
        )
        .map_err(HandlerErr::query)?;
    let plan_rows = stmt
        .query_map([&batch_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut plans = Vec::with_capacity(plan_rows.len());
    for (id, name, plan_type, params_raw) in plan_rows {
        let installments = plan_installments_json(conn, &id)?;
        plans.push(json!({
            "planId": id,
            "name": name,
            "type": plan_type,
            "params": serde_json::from_str::<serde_json::Value>(&params_raw)
                .unwrap_or_else(|_| json!({})),
            "installments": installments,
        }));
    }
    Ok(json!({ "batchId": batch_id, "plans": plans }))
}

fn delete_plan(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let plan_id = get_required_str(params, "planId")?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "DELETE FROM fee_plan_installments WHERE plan_id = ?",
        [&plan_id],
    )
    .map_err(|e| HandlerErr::update(e, "fee_plan_installments"))?;
    let deleted = tx
        .execute(
            "DELETE FROM fee_plans WHERE id = ? AND batch_id = ?",
            (&plan_id, &batch_id),
        )
        .map_err(|e| HandlerErr::update(e, "fee_plans"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("plan not found"));
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({ "deleted": true }))
}

/// Copy the plan's installments into the student's fee detail, resolving
/// each offset against the admission date. The copies are frozen: plan
/// edits after this point do not touch them.
fn assign_plan(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let plan_id = get_required_str(params, "planId")?;
    let replace = params
        .get("replace")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let admission: Option<String> = conn
        .query_row(
            "SELECT admission_date FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(admission_raw) = admission else {
        return Err(HandlerErr::not_found("student not found"));
    };
    let admission_date = NaiveDate::parse_from_str(&admission_raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr {
            code: "internal",
            message: format!("stored admission date is malformed: {}", admission_raw),
            details: None,
        })?;

    let plan_name: Option<String> = conn
        .query_row("SELECT name FROM fee_plans WHERE id = ?", [&plan_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(plan_name) = plan_name else {
        return Err(HandlerErr::not_found("plan not found"));
    };

    let existing: Option<String> = conn
        .query_row(
            "SELECT plan_id FROM student_fees WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if existing.is_some() {
        let collected: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM student_installments
                 WHERE student_id = ? AND status = 'paid'",
                [&student_id],
                |r| r.get(0),
            )
            .map_err(HandlerErr::query)?;
        if collected > 0 {
            return Err(HandlerErr {
                code: "conflict",
                message: "student already has collected installments".to_string(),
                details: Some(json!({ "paidCount": collected })),
            });
        }
        if !replace {
            return Err(HandlerErr::conflict(
                "conflict",
                "student already has a fee plan; pass replace to overwrite",
            ));
        }
    }

    let mut stmt = conn
        .prepare(
            "SELECT seq, description, amount, offset_months
             FROM fee_plan_installments WHERE plan_id = ? ORDER BY seq",
        )
        .map_err(HandlerErr::query)?;
    let template_rows = stmt
        .query_map([&plan_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "DELETE FROM student_installments WHERE student_id = ?",
        [&student_id],
    )
    .map_err(|e| HandlerErr::update(e, "student_installments"))?;
    tx.execute(
        "INSERT INTO student_fees(student_id, plan_id, plan_name, assigned_at)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(student_id) DO UPDATE SET
           plan_id = excluded.plan_id,
           plan_name = excluded.plan_name,
           assigned_at = excluded.assigned_at",
        (&student_id, &plan_id, &plan_name, now_iso()),
    )
    .map_err(|e| HandlerErr::insert(e, "student_fees"))?;

    let mut due_dates = Vec::with_capacity(template_rows.len());
    for (seq, description, amount, offset_months) in &template_rows {
        let due = resolve_due_date(admission_date, *offset_months as u32);
        due_dates.push(due.to_string());
        tx.execute(
            "INSERT INTO student_installments(id, student_id, seq, description, amount,
                                              due_date, status)
             VALUES(?, ?, ?, ?, ?, ?, 'pending')",
            (
                Uuid::new_v4().to_string(),
                &student_id,
                seq,
                description,
                amount,
                due.to_string(),
            ),
        )
        .map_err(|e| HandlerErr::insert(e, "student_installments"))?;
    }
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "studentId": student_id,
        "planId": plan_id,
        "installmentCount": template_rows.len(),
        "dueDates": due_dates,
    }))
}

fn get_student_fees(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let detail: Option<(String, String, String)> = conn
        .query_row(
            "SELECT plan_id, plan_name, assigned_at FROM student_fees WHERE student_id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((plan_id, plan_name, assigned_at)) = detail else {
        return Ok(json!({ "detail": null }));
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, description, amount, due_date, status, paid_on,
                    payment_method, receipt_no, collected_by
             FROM student_installments
             WHERE student_id = ?
             ORDER BY seq",
        )
        .map_err(HandlerErr::query)?;
    let installments = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "installmentId": r.get::<_, String>(0)?,
                "description": r.get::<_, String>(1)?,
                "amount": r.get::<_, f64>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "paidOn": r.get::<_, Option<String>>(5)?,
                "paymentMethod": r.get::<_, Option<String>>(6)?,
                "receiptNo": r.get::<_, Option<String>>(7)?,
                "collectedBy": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({
        "detail": {
            "studentId": student_id,
            "planId": plan_id,
            "planName": plan_name,
            "assignedAt": assigned_at,
            "installments": installments,
        }
    }))
}

/// Dual write: installment flips to paid and the receipt row lands in the
/// same transaction.
fn collect(
    conn: &Connection,
    actor: Option<String>,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let installment_id = get_required_str(params, "installmentId")?;
    let method = get_optional_str(params, "method");
    let collected_by = get_optional_str(params, "collectedBy").or(actor);

    let row: Option<(String, f64)> = conn
        .query_row(
            "SELECT status, amount FROM student_installments
             WHERE id = ? AND student_id = ?",
            (&installment_id, &student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((status, amount)) = row else {
        return Err(HandlerErr::not_found("installment not found"));
    };
    if status == "paid" {
        return Err(HandlerErr::conflict(
            "already_paid",
            "installment is already collected",
        ));
    }

    let paid_on = Local::now().date_naive().to_string();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let seq: i64 = tx
        .query_row("SELECT COUNT(*) + 1 FROM receipts", [], |r| r.get(0))
        .map_err(HandlerErr::query)?;
    let receipt_no = format!("RCP-{:06}", seq);
    tx.execute(
        "UPDATE student_installments
         SET status = 'paid', paid_on = ?, payment_method = ?, receipt_no = ?, collected_by = ?
         WHERE id = ?",
        (&paid_on, &method, &receipt_no, &collected_by, &installment_id),
    )
    .map_err(|e| HandlerErr::update(e, "student_installments"))?;
    tx.execute(
        "INSERT INTO receipts(id, receipt_no, student_id, installment_id, amount,
                              payment_method, collected_by, issued_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &receipt_no,
            &student_id,
            &installment_id,
            amount,
            &method,
            &collected_by,
            now_iso(),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "receipts"))?;
    tx.commit().map_err(HandlerErr::commit)?;

    Ok(json!({
        "receiptNo": receipt_no,
        "amount": amount,
        "paidOn": paid_on,
    }))
}

fn receipts(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT receipt_no, installment_id, amount, payment_method, collected_by, issued_at
             FROM receipts
             WHERE student_id = ?
             ORDER BY issued_at",
        )
        .map_err(HandlerErr::query)?;
    let receipts = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "receiptNo": r.get::<_, String>(0)?,
                "installmentId": r.get::<_, String>(1)?,
                "amount": r.get::<_, f64>(2)?,
                "paymentMethod": r.get::<_, Option<String>>(3)?,
                "collectedBy": r.get::<_, Option<String>>(4)?,
                "issuedAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "receipts": receipts }))
}

/// Best-effort receipt notice to the guardian. Same policy as the absence
/// fan-out: the payment is already durable, failures are logged only.
fn notify_receipt(
    conn: &Connection,
    mailer: Arc<dyn MailSender>,
    student_id: &str,
    receipt_no: &str,
    amount: f64,
) {
    let row = conn
        .query_row(
            "SELECT first_name, last_name, guardian_email FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional();
    let (first, last, email) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "guardian lookup failed; skipping receipt notice");
            return;
        }
    };
    let Some(email) = email else { return };

    let (subject_tpl, body_tpl) = match db::settings_get_json(conn, "emailTemplates.feeReceipt") {
        Ok(Some(v)) => (
            v.get("subject")
                .and_then(|s| s.as_str())
                .unwrap_or("Payment received: {{receiptNo}}")
                .to_string(),
            v.get("body")
                .and_then(|s| s.as_str())
                .unwrap_or("<p>We received {{amount}} towards {{studentName}}'s fees.</p>")
                .to_string(),
        ),
        _ => (
            "Payment received: {{receiptNo}}".to_string(),
            "<p>Dear guardian,</p>\
<p>We received {{amount}} towards {{studentName}}'s fees. Receipt {{receiptNo}}.</p>"
                .to_string(),
        ),
    };

    let student_name = format!("{} {}", first, last);
    let amount_text = format!("{}", amount);
    let vars = [
        ("studentName", student_name.as_str()),
        ("receiptNo", receipt_no),
        ("amount", amount_text.as_str()),
    ];
    notify::dispatch_detached(
        mailer,
        vec![MailMessage {
            to: email,
            subject: notify::render_template(&subject_tpl, &vars),
            html_body: notify::render_template(&body_tpl, &vars),
        }],
    );
}

fn handle_collect(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let actor = state.session.as_ref().map(|s| s.user_name.clone());
    match collect(conn, actor, &req.params) {
        Ok(result) => {
            if let (Some(mailer), Some(receipt_no), Some(amount)) = (
                state.mailer.as_ref(),
                result.get("receiptNo").and_then(|v| v.as_str()),
                result.get("amount").and_then(|v| v.as_f64()),
            ) {
                let student_id = req
                    .params
                    .get("studentId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                notify_receipt(conn, Arc::clone(mailer), student_id, receipt_no, amount);
            }
            ok(&req.id, result)
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
        "feeStructures.savePlan" => Some(run(save_plan, state, req)),
        "feeStructures.get" => Some(run(get_structure, state, req)),
        "feeStructures.deletePlan" => Some(run(delete_plan, state, req)),
        "studentFees.assignPlan" => Some(run(assign_plan, state, req)),
        "studentFees.get" => Some(run(get_student_fees, state, req)),
        "studentFees.collect" => Some(handle_collect(state, req)),
        "studentFees.receipts" => Some(run(receipts, state, req)),
        _ => None,
    }
}
