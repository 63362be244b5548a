use crate::calc::{self, CaError};
use crate::ipc::helpers::{
    number_in, parse_number, required_int_in, required_str, run_with_db, to_json, Handler,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::marks::{ExamType, MarkRecord, MarkStoreError, NewMarkRecord, SqliteMarkStore, Subject};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

const MAX_SUBJECT_MARKS: f64 = 100.0;

fn parse_subjects(params: &Value) -> Result<Vec<Subject>, HandlerErr> {
    let Some(raw) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };
    if raw.is_empty() {
        return Err(HandlerErr::bad_params("at least one subject is required"));
    }

    let mut subjects = Vec::with_capacity(raw.len());
    for (i, s) in raw.iter().enumerate() {
        let at = |e: HandlerErr| {
            let message = format!("subjects[{i}]: {}", e.message);
            HandlerErr { message, ..e }
        };
        if !s.is_object() {
            return Err(HandlerErr::bad_params(format!("subjects[{i}] must be an object")));
        }
        let code = required_str(s, "code").map_err(at)?;
        let name = required_str(s, "name").map_err(at)?;
        let marks = s
            .get("marks")
            .ok_or_else(|| HandlerErr::bad_params("missing marks"))
            .and_then(|v| number_in("marks", v, 0.0, MAX_SUBJECT_MARKS))
            .map_err(at)?;
        subjects.push(Subject { code, name, marks });
    }
    Ok(subjects)
}

/// Uses the caller's total when given, else the sum of subject marks.
fn resolve_total(params: &Value, subjects: &[Subject]) -> Result<f64, HandlerErr> {
    let ceiling = MAX_SUBJECT_MARKS * subjects.len() as f64;
    match params.get("totalMarks") {
        None | Some(Value::Null) => Ok(subjects.iter().map(|s| s.marks).sum()),
        Some(v) => {
            let Some(total) = parse_number(v) else {
                return Err(HandlerErr::bad_params("totalMarks must be a number"));
            };
            if total < 0.0 || total > ceiling {
                return Err(HandlerErr::bad_params(format!(
                    "totalMarks must be between 0 and {ceiling}"
                ))
                .with_details(json!({ "totalMarks": total, "subjectCount": subjects.len() })));
            }
            Ok(total)
        }
    }
}

fn parse_new_record(params: &Value) -> Result<NewMarkRecord, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let academic_year = required_int_in(params, "academicYear", 1, 4)?;
    let semester = required_int_in(params, "semester", 1, 2)?;
    let exam_type_raw = required_str(params, "examType")?;
    let Some(exam_type) = ExamType::parse(&exam_type_raw) else {
        return Err(HandlerErr::bad_params("examType must be one of: mid, final")
            .with_details(json!({ "value": exam_type_raw })));
    };
    let subjects = parse_subjects(params)?;
    let total_marks = resolve_total(params, &subjects)?;
    Ok(NewMarkRecord {
        student_id,
        academic_year,
        semester,
        exam_type,
        subjects,
        total_marks,
    })
}

/// Attaches the referenced student's name and number to each record.
fn with_students(conn: &Connection, records: Vec<MarkRecord>) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT first_name, last_name, student_number FROM students WHERE id = ?")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let mut cache: HashMap<String, Value> = HashMap::new();
    let mut out = Vec::with_capacity(records.len());
    for rec in records {
        if !cache.contains_key(&rec.student_id) {
            let student = stmt
                .query_row([&rec.student_id], |r| {
                    Ok(json!({
                        "id": &rec.student_id,
                        "firstName": r.get::<_, Option<String>>(0)?,
                        "lastName": r.get::<_, Option<String>>(1)?,
                        "studentNumber": r.get::<_, Option<String>>(2)?,
                    }))
                })
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?
                .unwrap_or(Value::Null);
            cache.insert(rec.student_id.clone(), student);
        }
        let mut v = to_json(&rec)?;
        v["student"] = cache.get(&rec.student_id).cloned().unwrap_or(Value::Null);
        out.push(v);
    }
    Ok(out)
}

fn handle_add(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let new = parse_new_record(params)?;
    info!(
        student_id = %new.student_id,
        academic_year = new.academic_year,
        semester = new.semester,
        exam_type = %new.exam_type,
        "adding marks"
    );

    match SqliteMarkStore::new(conn).insert(&new) {
        Ok(record) => {
            info!(mark_id = %record.id, "marks saved");
            to_json(&record)
        }
        Err(e @ MarkStoreError::Duplicate { .. }) => {
            warn!(student_id = %new.student_id, error = %e, "duplicate sitting rejected");
            Err(HandlerErr::conflict(e.to_string()).with_details(json!({
                "studentId": new.student_id,
                "academicYear": new.academic_year,
                "semester": new.semester,
                "examType": new.exam_type,
            })))
        }
        Err(MarkStoreError::StudentNotFound(_)) => Err(HandlerErr::not_found("student not found")),
        Err(MarkStoreError::Db(e)) => Err(
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "marks" })),
        ),
    }
}

fn handle_student(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let records = SqliteMarkStore::new(conn)
        .list_for_student(&student_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "marks": with_students(conn, records)? }))
}

fn handle_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let records = SqliteMarkStore::new(conn)
        .list_all()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "marks": with_students(conn, records)? }))
}

fn handle_calculate_ca(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    let academic_year = required_int_in(params, "academicYear", 1, 4)?;

    let store = SqliteMarkStore::new(conn);
    match calc::compute_ca_marks(&store, &student_id, academic_year) {
        Ok(result) => {
            info!(
                student_id = %student_id,
                academic_year,
                ca_marks = result.ca_marks,
                "ca marks calculated"
            );
            to_json(&result)
        }
        Err(e) => {
            if !matches!(e, CaError::MissingPrerequisiteData { .. }) {
                warn!(student_id = %student_id, academic_year, error = %e, "ca calculation failed");
            }
            Err(ca_error(e))
        }
    }
}

fn ca_error(e: CaError) -> HandlerErr {
    let message = e.to_string();
    match e {
        CaError::MissingPrerequisiteData { missing } => {
            HandlerErr::new("missing_prerequisite_data", message)
                .with_details(json!({ "missing": missing }))
        }
        CaError::InvalidRecordState {
            record_id, sitting, ..
        } => HandlerErr::new("invalid_record_state", message).with_details(json!({
            "recordId": record_id,
            "semester": sitting.semester,
            "examType": sitting.exam_type,
        })),
        CaError::Store(e) => HandlerErr::db("db_query_failed", e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "marks.add" => handle_add,
        "marks.student" => handle_student,
        "marks.list" => handle_list,
        "marks.calculateCa" => handle_calculate_ca,
        _ => return None,
    };
    Some(run_with_db(state, req, handler))
}
