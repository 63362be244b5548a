use crate::db;
use crate::ipc::helpers::{
    is_present, one_of, optional_str, parse_number, required_str, run_with_db, Handler, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

const LEVELS: &[&str] = &["Beginner", "Intermediate", "Advanced"];
const REQUIRED_FIELDS: &[&str] = &[
    "courseCode",
    "title",
    "instructor",
    "category",
    "price",
    "duration",
    "level",
    "description",
];
/// Text fields a patch may touch, with their column names. The course code
/// is fixed once registered.
const PATCHABLE_TEXT: &[(&str, &str)] = &[
    ("title", "title"),
    ("instructor", "instructor"),
    ("category", "category"),
    ("duration", "duration"),
    ("description", "description"),
];

const COURSE_COLUMNS: &str =
    "id, course_code, title, instructor, category, price, duration, level, description, created_at, updated_at";

fn read_course(row: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "courseCode": row.get::<_, String>(1)?,
        "title": row.get::<_, String>(2)?,
        "instructor": row.get::<_, String>(3)?,
        "category": row.get::<_, String>(4)?,
        "price": row.get::<_, f64>(5)?,
        "duration": row.get::<_, String>(6)?,
        "level": row.get::<_, String>(7)?,
        "description": row.get::<_, String>(8)?,
        "createdAt": row.get::<_, String>(9)?,
        "updatedAt": row.get::<_, String>(10)?,
    }))
}

fn load_course(conn: &Connection, course_id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        &format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?"),
        [course_id],
        read_course,
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn price_of(value: &Value) -> Result<f64, HandlerErr> {
    let Some(price) = parse_number(value) else {
        return Err(HandlerErr::bad_params("price must be a number"));
    };
    if price < 0.0 {
        return Err(HandlerErr::bad_params("price cannot be negative"));
    }
    Ok(price)
}

fn handle_register(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|k| !is_present(params, k))
        .collect();
    if !missing.is_empty() {
        return Err(HandlerErr::bad_params(format!(
            "missing required fields: {}",
            missing.join(", ")
        ))
        .with_details(json!({ "fields": missing })));
    }

    let course_code = required_str(params, "courseCode")?.to_uppercase();
    let title = required_str(params, "title")?;
    let instructor = required_str(params, "instructor")?;
    let category = required_str(params, "category")?;
    let price = price_of(&params["price"])?;
    let duration = required_str(params, "duration")?;
    let level = one_of("level", &required_str(params, "level")?, LEVELS)?;
    let description = required_str(params, "description")?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM courses WHERE course_code = ?",
            [&course_code],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if existing.is_some() {
        return Err(HandlerErr::conflict(
            "course with this course code already exists",
        ));
    }

    let course_id = Uuid::new_v4().to_string();
    let now = db::now_timestamp();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, course_code, title, instructor, category, price, duration,
            level, description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &course_id,
            &course_code,
            &title,
            &instructor,
            &category,
            price,
            &duration,
            level,
            &description,
            &now,
            &now
        ],
    ) {
        if db::is_unique_violation(&e) {
            return Err(HandlerErr::conflict(
                "course with this course code already exists",
            ));
        }
        return Err(HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "courses" })));
    }
    info!(course_id = %course_id, course_code = %course_code, "course registered");

    load_course(conn, &course_id)?.ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn handle_list(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {COURSE_COLUMNS} FROM courses ORDER BY created_at DESC, rowid DESC"
        ))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let courses = stmt
        .query_map([], read_course)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "courses": courses }))
}

fn handle_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    load_course(conn, &course_id)?.ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn handle_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    if optional_str(patch, "courseCode")?.is_some() {
        return Err(HandlerErr::bad_params("courseCode cannot be changed"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    for (key, column) in PATCHABLE_TEXT {
        if patch.get(*key).is_none() {
            continue;
        }
        // Present keys must carry a usable value; blanking a required field is rejected.
        let v = required_str(patch, key)?;
        sets.push(*column);
        values.push(SqlValue::Text(v));
    }
    if let Some(raw) = patch.get("price") {
        sets.push("price");
        values.push(SqlValue::Real(price_of(raw)?));
    }
    if patch.get("level").is_some() {
        let level = one_of("level", &required_str(patch, "level")?, LEVELS)?;
        sets.push("level");
        values.push(SqlValue::Text(level.to_string()));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("patch has no updatable fields"));
    }

    sets.push("updated_at");
    values.push(SqlValue::Text(db::now_timestamp()));
    values.push(SqlValue::Text(course_id.clone()));

    let assignments = sets
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    let changed = conn
        .execute(
            &format!("UPDATE courses SET {assignments} WHERE id = ?"),
            params_from_iter(values),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }

    load_course(conn, &course_id)?.ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn handle_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let removed = conn
        .execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("course not found"));
    }
    info!(course_id = %course_id, "course deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "courses.register" => handle_register,
        "courses.list" => handle_list,
        "courses.get" => handle_get,
        "courses.update" => handle_update,
        "courses.delete" => handle_delete,
        _ => return None,
    };
    Some(run_with_db(state, req, handler))
}
