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

#[test]
fn collection_flips_the_installment_and_issues_a_receipt_atomically() {
    let workspace = temp_dir("tutord-fee-collect");
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
                "name": "Monthly",
                "type": "monthly",
                "monthlyAmount": 2500.0,
                "totalMonths": 2
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
    let installments = detail
        .get("detail")
        .and_then(|d| d.get("installments"))
        .and_then(|v| v.as_array())
        .expect("installments")
        .clone();
    let first_installment = installments[0]
        .get("installmentId")
        .and_then(|v| v.as_str())
        .expect("installmentId")
        .to_string();

    let collected = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "studentFees.collect",
        json!({
            "studentId": student_id,
            "installmentId": first_installment,
            "method": "cash",
            "collectedBy": "Front Desk"
        }),
    );
    let receipt_no = collected
        .get("receiptNo")
        .and_then(|v| v.as_str())
        .expect("receiptNo")
        .to_string();
    assert!(receipt_no.starts_with("RCP-"), "receipt: {}", receipt_no);
    assert_eq!(collected.get("amount").and_then(|v| v.as_f64()), Some(2500.0));

    // The installment carries the payment metadata...
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "studentFees.get",
        json!({ "studentId": student_id }),
    );
    let installments = detail
        .get("detail")
        .and_then(|d| d.get("installments"))
        .and_then(|v| v.as_array())
        .expect("installments")
        .clone();
    let paid = &installments[0];
    assert_eq!(paid.get("status").and_then(|v| v.as_str()), Some("paid"));
    assert_eq!(
        paid.get("receiptNo").and_then(|v| v.as_str()),
        Some(receipt_no.as_str())
    );
    assert_eq!(
        paid.get("paymentMethod").and_then(|v| v.as_str()),
        Some("cash")
    );
    assert_eq!(
        paid.get("collectedBy").and_then(|v| v.as_str()),
        Some("Front Desk")
    );
    assert_eq!(
        installments[1].get("status").and_then(|v| v.as_str()),
        Some("pending"),
        "only the collected installment flips"
    );

    // ...and the receipt row landed with it.
    let receipts = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "studentFees.receipts",
        json!({ "studentId": student_id }),
    );
    let receipts = receipts
        .get("receipts")
        .and_then(|v| v.as_array())
        .expect("receipts");
    assert_eq!(receipts.len(), 1);
    assert_eq!(
        receipts[0].get("receiptNo").and_then(|v| v.as_str()),
        Some(receipt_no.as_str())
    );
    assert_eq!(
        receipts[0].get("amount").and_then(|v| v.as_f64()),
        Some(2500.0)
    );

    // Collecting the same installment twice is a conflict.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "10",
        "studentFees.collect",
        json!({ "studentId": student_id, "installmentId": first_installment }),
    );
    assert_eq!(code, "already_paid");

    // A collected detail can no longer be replaced.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "11",
        "studentFees.assignPlan",
        json!({ "studentId": student_id, "planId": plan_id, "replace": true }),
    );
    assert_eq!(code, "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
