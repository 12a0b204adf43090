use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_f64, get_required_str,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let category = get_required_str(params, "category")?;
    let amount = get_required_f64(params, "amount")?;
    if amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be positive"));
    }
    let spent_on = get_required_date(params, "spentOn")?;

    let expense_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO expenses(id, category, amount, spent_on, note)
         VALUES(?, ?, ?, ?, ?)",
        (
            &expense_id,
            &category,
            amount,
            spent_on.to_string(),
            get_optional_str(params, "note"),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "expenses"))?;

    Ok(json!({ "expenseId": expense_id }))
}

fn list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, category, amount, spent_on, note
             FROM expenses ORDER BY spent_on DESC",
        )
        .map_err(HandlerErr::query)?;
    let expenses = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "category": r.get::<_, String>(1)?,
                "amount": r.get::<_, f64>(2)?,
                "spentOn": r.get::<_, String>(3)?,
                "note": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "expenses": expenses }))
}

fn delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let expense_id = get_required_str(params, "expenseId")?;
    let deleted = conn
        .execute("DELETE FROM expenses WHERE id = ?", [&expense_id])
        .map_err(|e| HandlerErr::update(e, "expenses"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("expense not found"));
    }
    Ok(json!({ "deleted": true }))
}

/// One payroll row per teacher per month; recording twice is a conflict,
/// not a silent overwrite.
fn payroll_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let month = get_required_str(params, "month")?;
    let amount = get_required_f64(params, "amount")?;
    if amount <= 0.0 {
        return Err(HandlerErr::bad_params("amount must be positive"));
    }

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("teacher not found"));
    }

    let already: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM payroll WHERE teacher_id = ? AND month = ?",
            (&teacher_id, &month),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if already.is_some() {
        return Err(HandlerErr::conflict(
            "conflict",
            "payroll already recorded for this teacher and month",
        ));
    }

    let paid_on = get_optional_date(params, "paidOn")?;
    let payroll_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO payroll(id, teacher_id, month, amount, paid_on, note)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &payroll_id,
            &teacher_id,
            &month,
            amount,
            paid_on.map(|d| d.to_string()),
            get_optional_str(params, "note"),
        ),
    )
    .map_err(|e| HandlerErr::insert(e, "payroll"))?;

    Ok(json!({ "payrollId": payroll_id }))
}

fn payroll_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_optional_str(params, "teacherId");
    let mut stmt = conn
        .prepare(
            "SELECT p.id, p.teacher_id, t.name, p.month, p.amount, p.paid_on, p.note
             FROM payroll p
             JOIN teachers t ON t.id = p.teacher_id
             WHERE ?1 IS NULL OR p.teacher_id = ?1
             ORDER BY p.month DESC",
        )
        .map_err(HandlerErr::query)?;
    let entries = stmt
        .query_map([&teacher_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacherName": r.get::<_, String>(2)?,
                "month": r.get::<_, String>(3)?,
                "amount": r.get::<_, f64>(4)?,
                "paidOn": r.get::<_, Option<String>>(5)?,
                "note": r.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "payroll": entries }))
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
        "expenses.create" => Some(run(create, state, req)),
        "expenses.list" => Some(run(list, state, req)),
        "expenses.delete" => Some(run(delete, state, req)),
        "payroll.record" => Some(run(payroll_record, state, req)),
        "payroll.list" => Some(run(payroll_list, state, req)),
        _ => None,
    }
}
