use crate::db;
use crate::ipc::helpers::{
    is_present, one_of, parse_date, required_str, run_with_db, Handler, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, Row};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const GENDERS: &[&str] = &["Male", "Female", "Other"];
const REQUIRED_FIELDS: &[&str] = &[
    "companyNumber",
    "name",
    "address",
    "gender",
    "phoneNumber",
    "dateOfBirth",
    "section",
];

fn read_employee(row: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "companyNumber": row.get::<_, String>(1)?,
        "name": row.get::<_, String>(2)?,
        "address": row.get::<_, String>(3)?,
        "gender": row.get::<_, String>(4)?,
        "phoneNumber": row.get::<_, String>(5)?,
        "dateOfBirth": row.get::<_, String>(6)?,
        "section": row.get::<_, String>(7)?,
        "createdAt": row.get::<_, String>(8)?,
        "updatedAt": row.get::<_, String>(9)?,
    }))
}

fn handle_register(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    if REQUIRED_FIELDS.iter().any(|k| !is_present(params, k)) {
        return Err(HandlerErr::bad_params(
            "all fields are required, including section",
        ));
    }
    let company_number = required_str(params, "companyNumber")?;
    let name = required_str(params, "name")?;
    let address = required_str(params, "address")?;
    let gender = one_of("gender", &required_str(params, "gender")?, GENDERS)?;
    let phone_number = required_str(params, "phoneNumber")?;
    let date_of_birth = parse_date("dateOfBirth", &required_str(params, "dateOfBirth")?)?;
    let section = required_str(params, "section")?;

    let employee_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    conn.execute(
        "INSERT INTO employees(id, company_number, name, address, gender, phone_number,
            date_of_birth, section, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &employee_id,
            &company_number,
            &name,
            &address,
            gender,
            &phone_number,
            &date_of_birth,
            &section,
            &now,
            &now
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "employees" })))?;
    info!(employee_id = %employee_id, "employee registered");

    Ok(json!({
        "id": employee_id,
        "companyNumber": company_number,
        "name": name,
        "address": address,
        "gender": gender,
        "phoneNumber": phone_number,
        "dateOfBirth": date_of_birth,
        "section": section,
        "createdAt": now,
        "updatedAt": now,
    }))
}

fn handle_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, company_number, name, address, gender, phone_number, date_of_birth,
                    section, created_at, updated_at
             FROM employees
             ORDER BY rowid",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let employees = stmt
        .query_map([], read_employee)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "employees": employees }))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let employee_id = required_str(params, "employeeId")?;
    let removed = conn
        .execute("DELETE FROM employees WHERE id = ?", [&employee_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("employee not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "employees.register" => handle_register,
        "employees.list" => handle_list,
        "employees.delete" => handle_delete,
        _ => return None,
    };
    Some(run_with_db(state, req, handler))
}
