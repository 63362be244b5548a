use crate::db;
use crate::ipc::helpers::{
    is_valid_email, max_chars, one_of, optional_str, parse_date, required_str, run_with_db,
    Handler, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const NAME_MAX_CHARS: usize = 50;
const GENDERS: &[&str] = &["Male", "Female"];
const ROLES: &[&str] = &["student", "admin", "faculty"];
const STATUSES: &[&str] = &["Active", "Inactive", "Suspended"];

const STUDENT_COLUMNS: &str = "id, first_name, last_name, email, student_number, gender, faculty,
    date_of_joining, phone, address, role, status, created_at, updated_at";

fn read_student(row: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "firstName": row.get::<_, Option<String>>(1)?,
        "lastName": row.get::<_, Option<String>>(2)?,
        "email": row.get::<_, String>(3)?,
        "studentNumber": row.get::<_, Option<String>>(4)?,
        "gender": row.get::<_, Option<String>>(5)?,
        "faculty": row.get::<_, Option<String>>(6)?,
        "dateOfJoining": row.get::<_, Option<String>>(7)?,
        "phone": row.get::<_, String>(8)?,
        "address": row.get::<_, String>(9)?,
        "role": row.get::<_, String>(10)?,
        "status": row.get::<_, String>(11)?,
        "createdAt": row.get::<_, String>(12)?,
        "updatedAt": row.get::<_, String>(13)?,
    }))
}

fn load_student_by(conn: &Connection, column: &str, value: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE {column} = ?"),
        [value],
        read_student,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn exists(conn: &Connection, sql: &str, value: &str) -> Result<bool, HandlerErr> {
    conn.query_row(sql, [value], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn optional_enum(
    params: &Value,
    key: &str,
    allowed: &[&'static str],
) -> Result<Option<&'static str>, HandlerErr> {
    optional_str(params, key)?
        .map(|raw| one_of(key, &raw, allowed))
        .transpose()
}

fn optional_name(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let v = optional_str(params, key)?;
    if let Some(name) = v.as_deref() {
        max_chars(key, name, NAME_MAX_CHARS)?;
    }
    Ok(v)
}

fn handle_register(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let email = required_str(params, "email")?.to_lowercase();
    if !is_valid_email(&email) {
        return Err(HandlerErr::bad_params("please enter a valid email"));
    }
    let phone = required_str(params, "phone")?;
    let address = required_str(params, "address")?;
    let first_name = optional_name(params, "firstName")?;
    let last_name = optional_name(params, "lastName")?;
    let student_number = optional_str(params, "studentNumber")?.map(|s| s.to_uppercase());
    let gender = optional_enum(params, "gender", GENDERS)?;
    let faculty = optional_str(params, "faculty")?;
    let date_of_joining = optional_str(params, "dateOfJoining")?
        .map(|d| parse_date("dateOfJoining", &d))
        .transpose()?;
    let role = optional_enum(params, "role", ROLES)?.unwrap_or("student");
    let status = optional_enum(params, "status", STATUSES)?.unwrap_or("Active");

    if exists(conn, "SELECT 1 FROM students WHERE email = ?", &email)? {
        return Err(HandlerErr::conflict(
            "email already in use, please choose a different one",
        ));
    }
    if let Some(sn) = student_number.as_deref() {
        if exists(conn, "SELECT 1 FROM students WHERE student_number = ?", sn)? {
            return Err(HandlerErr::conflict("student number already in use"));
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, first_name, last_name, email, student_number, gender, faculty,
            date_of_joining, phone, address, role, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &student_id,
            first_name,
            last_name,
            &email,
            student_number,
            gender,
            faculty,
            date_of_joining,
            &phone,
            &address,
            role,
            status,
            &now,
            &now
        ],
    ) {
        if db::is_unique_violation(&e) {
            return Err(HandlerErr::conflict("student already exists"));
        }
        return Err(HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" })));
    }
    info!(student_id = %student_id, "student registered");

    load_student_by(conn, "id", &student_id)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn handle_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY rowid"))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map([], read_student)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let found = if let Some(id) = optional_str(params, "studentId")? {
        load_student_by(conn, "id", &id)?
    } else if let Some(email) = optional_str(params, "email")? {
        load_student_by(conn, "email", &email.to_lowercase())?
    } else {
        return Err(HandlerErr::bad_params("missing studentId or email"));
    };
    found.ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn handle_update_profile(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let email = required_str(params, "email")?.to_lowercase();
    let patch = params.get("patch").unwrap_or(params);
    let phone = optional_str(patch, "phone")?;
    let address = optional_str(patch, "address")?;
    if phone.is_none() && address.is_none() {
        return Err(HandlerErr::bad_params("nothing to update: provide phone and/or address"));
    }

    let changed = conn
        .execute(
            "UPDATE students
             SET phone = COALESCE(?, phone), address = COALESCE(?, address), updated_at = ?
             WHERE email = ?",
            rusqlite::params![phone, address, db::now_timestamp(), &email],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student not found"));
    }

    load_student_by(conn, "email", &email)?
        .ok_or_else(|| HandlerErr::not_found("student not found"))
}

fn handle_count(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "count": count }))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    if !exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Dependency order; there is no ON DELETE CASCADE.
    let steps: [(&str, &str); 3] = [
        (
            "mark_subjects",
            "DELETE FROM mark_subjects WHERE mark_id IN (SELECT id FROM marks WHERE student_id = ?)",
        ),
        ("marks", "DELETE FROM marks WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        // Returning early drops `tx`, which rolls back.
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    info!(student_id = %student_id, "student deleted");

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "students.register" => handle_register,
        "students.list" => handle_list,
        "students.get" => handle_get,
        "students.updateProfile" => handle_update_profile,
        "students.count" => handle_count,
        "students.delete" => handle_delete,
        _ => return None,
    };
    Some(run_with_db(state, req, handler))
}
