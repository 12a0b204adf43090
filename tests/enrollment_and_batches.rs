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
fn enrollment_issues_working_credentials() {
    let workspace = temp_dir("tutord-enroll-creds");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.enroll",
        json!({
            "firstName": "Asha",
            "lastName": "Rao",
            "admissionDate": "2026-01-10"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let user_name = student
        .get("userName")
        .and_then(|v| v.as_str())
        .expect("userName")
        .to_string();
    let password = student
        .get("password")
        .and_then(|v| v.as_str())
        .expect("password")
        .to_string();
    assert!(!password.is_empty());

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.signIn",
        json!({ "userName": user_name, "password": password }),
    );
    assert_eq!(session.get("role").and_then(|v| v.as_str()), Some("student"));
    assert_eq!(
        session.get("personId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );

    let current = request_ok(&mut stdin, &mut reader, "4", "session.current", json!({}));
    assert_eq!(
        current.get("userName").and_then(|v| v.as_str()),
        Some(user_name.as_str())
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "session.signIn",
        json!({ "userName": user_name, "password": "wrong" }),
    );
    assert_eq!(code, "auth_failed");

    let _ = request_ok(&mut stdin, &mut reader, "6", "session.signOut", json!({}));
    let current = request_ok(&mut stdin, &mut reader, "7", "session.current", json!({}));
    assert!(current.is_null());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_rename_is_a_single_row_update_visible_through_ids() {
    let workspace = temp_dir("tutord-batch-rename");
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
        json!({ "name": "Physics 2026", "status": "active" }),
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
            "admissionDate": "2026-01-10"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "batches.update",
        json!({ "batchId": batch_id, "patch": { "name": "Physics Evening 2026" } }),
    );

    // The student still points at the same batch id and sees the new name.
    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        fetched
            .get("student")
            .and_then(|s| s.get("batchId"))
            .and_then(|v| v.as_str()),
        Some(batch_id.as_str())
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "batches.get",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(
        got.get("batch")
            .and_then(|b| b.get("name"))
            .and_then(|v| v.as_str()),
        Some("Physics Evening 2026")
    );

    // A batch with students refuses deletion.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "7",
        "batches.delete",
        json!({ "batchId": batch_id }),
    );
    assert_eq!(code, "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_capacity_limits_active_enrollment() {
    let workspace = temp_dir("tutord-batch-capacity");
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
        json!({ "name": "Tiny Batch", "capacity": 1, "status": "active" }),
    );
    let batch_id = batch
        .get("batchId")
        .and_then(|v| v.as_str())
        .expect("batchId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.enroll",
        json!({
            "firstName": "Asha",
            "lastName": "Rao",
            "batchId": batch_id,
            "admissionDate": "2026-01-10"
        }),
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "students.enroll",
        json!({
            "firstName": "Vikram",
            "lastName": "Shah",
            "batchId": batch_id,
            "admissionDate": "2026-01-10"
        }),
    );
    assert_eq!(code, "batch_full");

    // Unassigned enrollment still works, and the student can join another batch.
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.enroll",
        json!({
            "firstName": "Vikram",
            "lastName": "Shah",
            "admissionDate": "2026-01-10"
        }),
    );
    let s2 = s2
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": s2, "patch": { "batchId": batch_id } }),
    );
    assert_eq!(code, "batch_full");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn deleting_a_student_removes_dependents_and_login() {
    let workspace = temp_dir("tutord-student-delete");
    let today = chrono::Local::now().date_naive().to_string();
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
        json!({ "name": "Batch A", "status": "active" }),
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
            "admissionDate": "2026-01-10"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let user_name = student
        .get("userName")
        .and_then(|v| v.as_str())
        .expect("userName")
        .to_string();
    let password = student
        .get("password")
        .and_then(|v| v.as_str())
        .expect("password")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.submit",
        json!({
            "batchId": batch_id,
            "date": today,
            "teacherName": "Priya Nair",
            "studentStatus": { student_id.clone(): "present" }
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "studentId": student_id }),
    );

    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "students.get",
        json!({ "studentId": student_id }),
    );
    assert_eq!(code, "not_found");
    let days = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.forStudent",
        json!({ "studentId": student_id }),
    );
    assert_eq!(
        days.get("days").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "8",
        "session.signIn",
        json!({ "userName": user_name, "password": password }),
    );
    assert_eq!(code, "auth_failed");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
