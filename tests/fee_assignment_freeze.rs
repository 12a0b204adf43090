use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_tutord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tutord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected {} to fail: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn installments_of(detail: &serde_json::Value) -> Vec<serde_json::Value> {
    detail
        .get("detail")
        .and_then(|d| d.get("installments"))
        .and_then(|v| v.as_array())
        .expect("installments")
        .clone()
}

#[test]
fn assigned_installments_resolve_due_dates_and_stay_frozen() {
    let workspace = temp_dir("tutord-fee-freeze");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        json!({ "name": "Fee Batch", "status": "active" }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.enroll",
        json!({
            "firstName": "Asha",
            "lastName": "Rao",
            "batchId": batch_id,
            "admissionDate": "2024-01-15"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "feeStructures.savePlan",
        json!({
            "batchId": batch_id,
            "plan": {
                "name": "Quarterly",
                "type": "quarterly",
                "quarterlyAmount": 6000.0,
                "totalQuarters": 4
            }
        }),
    );
    let plan_id = plan
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "studentFees.assignPlan",
        json!({ "studentId": student_id, "planId": plan_id }),
    );
    assert_eq!(
        assigned.get("installmentCount").and_then(|v| v.as_i64()),
        Some(4)
    );

    // offsetMonths 0, 3, 6, 9 against an admission of 2024-01-15.
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "studentFees.get",
        json!({ "studentId": student_id }),
    );
    let installments = installments_of(&detail);
    let due_dates: Vec<&str> = installments
        .iter()
        .filter_map(|i| i.get("dueDate").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(
        due_dates,
        vec!["2024-01-15", "2024-04-15", "2024-07-15", "2024-10-15"]
    );
    for inst in &installments {
        assert_eq!(inst.get("amount").and_then(|v| v.as_f64()), Some(6000.0));
        assert_eq!(
            inst.get("status").and_then(|v| v.as_str()),
            Some("pending")
        );
    }

    // Editing the template afterwards must not reach into assigned details.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "feeStructures.savePlan",
        json!({
            "batchId": batch_id,
            "plan": {
                "planId": plan_id,
                "name": "Quarterly",
                "type": "quarterly",
                "quarterlyAmount": 9000.0,
                "totalQuarters": 2
            }
        }),
    );
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "studentFees.get",
        json!({ "studentId": student_id }),
    );
    let installments = installments_of(&detail);
    assert_eq!(installments.len(), 4, "installment list is frozen");
    for inst in &installments {
        assert_eq!(
            inst.get("amount").and_then(|v| v.as_f64()),
            Some(6000.0),
            "amounts are frozen at assignment time"
        );
    }

    // Re-assignment without replace is refused.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "9",
        "studentFees.assignPlan",
        json!({ "studentId": student_id, "planId": plan_id }),
    );
    assert_eq!(code, "conflict");

    // With replace (and nothing collected), the new template takes over.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "studentFees.assignPlan",
        json!({ "studentId": student_id, "planId": plan_id, "replace": true }),
    );
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "studentFees.get",
        json!({ "studentId": student_id }),
    );
    let installments = installments_of(&detail);
    assert_eq!(installments.len(), 2);
    assert_eq!(
        installments[0].get("amount").and_then(|v| v.as_f64()),
        Some(9000.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn month_end_admissions_clamp_resolved_due_dates() {
    let workspace = temp_dir("tutord-fee-clamp");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let batch = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "batches.create",
        json!({ "name": "Fee Batch", "status": "active" }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.enroll",
        json!({
            "firstName": "Vikram",
            "lastName": "Shah",
            "batchId": batch_id,
            "admissionDate": "2024-01-31"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "feeStructures.savePlan",
        json!({
            "batchId": batch_id,
            "plan": {
                "name": "Monthly",
                "type": "monthly",
                "monthlyAmount": 2500.0,
                "totalMonths": 3
            }
        }),
    );
    let plan_id = plan
        .get("planId")
        .and_then(|v| v.as_str())
        .expect("planId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "studentFees.assignPlan",
        json!({ "studentId": student_id, "planId": plan_id }),
    );
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "studentFees.get",
        json!({ "studentId": student_id }),
    );
    let installments = installments_of(&detail);
    let due_dates: Vec<&str> = installments
        .iter()
        .filter_map(|i| i.get("dueDate").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(due_dates, vec!["2024-01-31", "2024-02-29", "2024-03-31"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
