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
    let exe = env!("CARGO_BIN_EXE_studentd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn studentd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false), "{}", value);
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

fn register_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    email: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "students.register",
        json!({
            "email": email,
            "phone": "0771234567",
            "address": "12 Lake Road",
            "firstName": "Nimal",
            "lastName": "Perera",
            "studentNumber": "it2001"
        }),
    );
    created
        .get("id")
        .and_then(|v| v.as_str())
        .expect("student id")
        .to_string()
}

fn sitting(student_id: &str, year: i64, semester: i64, exam: &str, marks: &[f64]) -> serde_json::Value {
    let subjects: Vec<serde_json::Value> = marks
        .iter()
        .enumerate()
        .map(|(i, m)| json!({ "code": format!("IT{}0{}", year, i), "name": format!("Module {}", i), "marks": m }))
        .collect();
    json!({
        "studentId": student_id,
        "academicYear": year,
        "semester": semester,
        "examType": exam,
        "subjects": subjects
    })
}

#[test]
fn ca_marks_follow_weighted_sittings() {
    let workspace = temp_dir("studentd-ca-known");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let sid = register_student(&mut stdin, &mut reader, "2", "nimal@uni.lk");

    // Two subjects per sitting; averages 80 / 70 / 90 / 85.
    request_ok(&mut stdin, &mut reader, "3", "marks.add", sitting(&sid, 1, 1, "mid", &[90.0, 70.0]));
    request_ok(&mut stdin, &mut reader, "4", "marks.add", sitting(&sid, 1, 1, "final", &[60.0, 80.0]));
    request_ok(&mut stdin, &mut reader, "5", "marks.add", sitting(&sid, 1, 2, "mid", &[100.0, 80.0]));

    // Three of four sittings: the calculation refuses.
    let partial = request(
        &mut stdin,
        &mut reader,
        "6",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": 1 }),
    );
    assert_eq!(error_code(&partial), "missing_prerequisite_data");
    let missing = partial["error"]["details"]["missing"]
        .as_array()
        .expect("missing list");
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0]["semester"], json!(2));
    assert_eq!(missing[0]["examType"], json!("final"));
    assert!(partial["error"]["message"]
        .as_str()
        .unwrap_or("")
        .contains("all mid and final marks for both semesters are required"));

    request_ok(&mut stdin, &mut reader, "7", "marks.add", sitting(&sid, 1, 2, "final", &[85.0, 85.0]));

    let ca = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": "1" }),
    );
    assert_eq!(ca["caMarks"], json!(83));
    assert_eq!(ca["studentId"], json!(sid));
    assert_eq!(ca["academicYear"], json!(1));
    assert_eq!(ca["averages"]["sem1Mid"].as_f64(), Some(80.0));
    assert_eq!(ca["averages"]["sem2Final"].as_f64(), Some(85.0));

    // Recomputed on demand, same answer every time.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": 1 }),
    );
    assert_eq!(again, ca);

    // Year 2 has nothing yet.
    let year2 = request(
        &mut stdin,
        &mut reader,
        "10",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": 2 }),
    );
    assert_eq!(error_code(&year2), "missing_prerequisite_data");
    assert_eq!(year2["error"]["details"]["missing"].as_array().map(|a| a.len()), Some(4));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn ca_marks_round_half_up() {
    let workspace = temp_dir("studentd-ca-rounding");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let sid = register_student(&mut stdin, &mut reader, "2", "kamal@uni.lk");

    // 75*0.10 + 90*0.15 + 90*0.15 + 80*0.60 = 82.5
    request_ok(&mut stdin, &mut reader, "3", "marks.add", sitting(&sid, 3, 1, "mid", &[75.0]));
    request_ok(&mut stdin, &mut reader, "4", "marks.add", sitting(&sid, 3, 1, "final", &[90.0]));
    request_ok(&mut stdin, &mut reader, "5", "marks.add", sitting(&sid, 3, 2, "mid", &[90.0]));
    request_ok(&mut stdin, &mut reader, "6", "marks.add", sitting(&sid, 3, 2, "final", &[80.0]));

    let ca = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": 3 }),
    );
    assert_eq!(ca["caMarks"], json!(83));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn duplicate_sitting_is_a_conflict_not_an_update() {
    let workspace = temp_dir("studentd-ca-duplicate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let sid = register_student(&mut stdin, &mut reader, "2", "sunil@uni.lk");

    request_ok(&mut stdin, &mut reader, "3", "marks.add", sitting(&sid, 2, 1, "mid", &[40.0]));
    let dup = request(&mut stdin, &mut reader, "4", "marks.add", sitting(&sid, 2, 1, "mid", &[99.0]));
    assert_eq!(error_code(&dup), "conflict");
    assert!(dup["error"]["message"]
        .as_str()
        .unwrap_or("")
        .contains("marks for mid exam already exist for this student in year 2 semester 1"));

    let listed = request_ok(&mut stdin, &mut reader, "5", "marks.student", json!({ "studentId": sid }));
    let marks = listed["marks"].as_array().expect("marks");
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0]["totalMarks"].as_f64(), Some(40.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn zero_subject_sitting_is_reported_as_invalid_state() {
    let workspace = temp_dir("studentd-ca-zero-subjects");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(&mut stdin, &mut reader, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let sid = register_student(&mut stdin, &mut reader, "2", "ruwan@uni.lk");

    request_ok(&mut stdin, &mut reader, "3", "marks.add", sitting(&sid, 1, 1, "mid", &[50.0]));
    request_ok(&mut stdin, &mut reader, "4", "marks.add", sitting(&sid, 1, 1, "final", &[50.0]));
    request_ok(&mut stdin, &mut reader, "5", "marks.add", sitting(&sid, 1, 2, "mid", &[50.0]));

    // The protocol refuses empty subject lists, so seed the broken row directly.
    {
        use rusqlite::Connection;
        let conn = Connection::open(workspace.join("studentd.sqlite3")).expect("open db");
        conn.execute(
            "INSERT INTO marks(id, student_id, academic_year, semester, exam_type, total_marks, created_at, updated_at)
             VALUES('broken-final', ?, 1, 2, 'final', 0, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
            [&sid],
        )
        .expect("seed zero-subject sitting");
    }

    let ca = request(
        &mut stdin,
        &mut reader,
        "6",
        "marks.calculateCa",
        json!({ "studentId": sid, "academicYear": 1 }),
    );
    assert_eq!(error_code(&ca), "invalid_record_state");
    assert_eq!(ca["error"]["details"]["recordId"], json!("broken-final"));
    assert_eq!(ca["error"]["details"]["semester"], json!(2));
    assert_eq!(ca["error"]["details"]["examType"], json!("final"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
