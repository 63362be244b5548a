use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

pub const DB_FILE_NAME: &str = "studentd.sqlite3";

/// Unique index that predates academic years: it allowed a single mid and a
/// single final per student in total.
const STALE_MARK_INDEXES: &[&str] = &["idx_marks_student_exam"];

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)?;
    init_schema(&conn)?;
    info!(path = %db_path.display(), "workspace database opened");
    Ok(conn)
}

/// Creates every table and index (idempotent) and applies startup migrations.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT,
            last_name TEXT,
            email TEXT NOT NULL UNIQUE,
            student_number TEXT UNIQUE,
            gender TEXT,
            faculty TEXT,
            date_of_joining TEXT,
            phone TEXT NOT NULL,
            address TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'student',
            status TEXT NOT NULL DEFAULT 'Active',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    ensure_students_account_columns(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS employees(
            id TEXT PRIMARY KEY,
            company_number TEXT NOT NULL,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            gender TEXT NOT NULL,
            phone_number TEXT NOT NULL,
            date_of_birth TEXT NOT NULL,
            section TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            course_code TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            instructor TEXT NOT NULL,
            category TEXT NOT NULL,
            price REAL NOT NULL,
            duration TEXT NOT NULL,
            level TEXT NOT NULL,
            description TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_created ON courses(created_at)",
        [],
    )?;

    // Index cleanup runs here, once per open, never on the write path.
    drop_stale_mark_indexes(conn)?;
    register_mark_collection(conn)?;

    Ok(())
}

/// Registers the mark record tables and the one-sitting-per-student unique
/// index. Safe to call any number of times.
pub fn register_mark_collection(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year INTEGER NOT NULL CHECK(academic_year BETWEEN 1 AND 4),
            semester INTEGER NOT NULL CHECK(semester IN (1, 2)),
            exam_type TEXT NOT NULL CHECK(exam_type IN ('mid', 'final')),
            total_marks REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_marks_student_year_semester_exam
         ON marks(student_id, academic_year, semester, exam_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mark_subjects(
            mark_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            marks REAL NOT NULL CHECK(marks >= 0 AND marks <= 100),
            PRIMARY KEY(mark_id, idx),
            FOREIGN KEY(mark_id) REFERENCES marks(id)
        )",
        [],
    )?;
    Ok(())
}

/// Workspaces created before accounts carried a role and status.
fn ensure_students_account_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "role")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN role TEXT NOT NULL DEFAULT 'student'",
            [],
        )?;
    }
    if !table_has_column(conn, "students", "status")? {
        conn.execute(
            "ALTER TABLE students ADD COLUMN status TEXT NOT NULL DEFAULT 'Active'",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Returns the names of the stale indexes that were dropped.
pub fn drop_stale_mark_indexes(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut dropped = Vec::new();
    for name in STALE_MARK_INDEXES {
        if !index_exists(conn, name)? {
            continue;
        }
        conn.execute(&format!("DROP INDEX IF EXISTS {}", name), [])?;
        info!(index = %name, "dropped stale mark index");
        dropped.push(name.to_string());
    }
    Ok(dropped)
}

pub fn index_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("first init");
        init_schema(&conn).expect("second init");
        register_mark_collection(&conn).expect("re-register");
        assert!(index_exists(&conn, "idx_marks_student_year_semester_exam").expect("index"));
    }

    #[test]
    fn startup_migration_drops_old_student_exam_index() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("init");
        conn.execute(
            "CREATE UNIQUE INDEX idx_marks_student_exam ON marks(student_id, exam_type)",
            [],
        )
        .expect("create stale index");

        let dropped = drop_stale_mark_indexes(&conn).expect("migrate");
        assert_eq!(dropped, vec!["idx_marks_student_exam".to_string()]);
        assert!(!index_exists(&conn, "idx_marks_student_exam").expect("index"));

        // Second pass finds nothing to do.
        assert!(drop_stale_mark_indexes(&conn).expect("migrate").is_empty());
    }

    #[test]
    fn old_students_table_gains_account_columns() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute(
            "CREATE TABLE students(
                id TEXT PRIMARY KEY,
                first_name TEXT,
                last_name TEXT,
                email TEXT NOT NULL UNIQUE,
                student_number TEXT UNIQUE,
                gender TEXT,
                faculty TEXT,
                date_of_joining TEXT,
                phone TEXT NOT NULL,
                address TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .expect("create old students");
        conn.execute(
            "INSERT INTO students(id, email, phone, address, created_at, updated_at)
             VALUES('s1', 'a@b.lk', '1', 'x', 't', 't')",
            [],
        )
        .expect("seed");

        init_schema(&conn).expect("init");
        let (role, status): (String, String) = conn
            .query_row("SELECT role, status FROM students WHERE id = 's1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .expect("row");
        assert_eq!(role, "student");
        assert_eq!(status, "Active");
    }

    #[test]
    fn open_db_creates_workspace_file() {
        let dir = std::env::temp_dir().join(format!("studentd-db-{}", uuid::Uuid::new_v4()));
        let _conn = open_db(&dir).expect("open db");
        assert!(dir.join(DB_FILE_NAME).is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
