use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamType {
    Mid,
    Final,
}

impl ExamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamType::Mid => "mid",
            ExamType::Final => "final",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mid" => Some(ExamType::Mid),
            "final" => Some(ExamType::Final),
            _ => None,
        }
    }
}

impl fmt::Display for ExamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ExamType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for ExamType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        ExamType::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown exam type: {raw}").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subject {
    pub code: String,
    pub name: String,
    pub marks: f64,
}

/// One exam sitting for one student.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub id: String,
    pub student_id: String,
    pub academic_year: i64,
    pub semester: i64,
    pub exam_type: ExamType,
    pub subjects: Vec<Subject>,
    pub total_marks: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// A validated sitting waiting to be inserted.
#[derive(Debug, Clone)]
pub struct NewMarkRecord {
    pub student_id: String,
    pub academic_year: i64,
    pub semester: i64,
    pub exam_type: ExamType,
    pub subjects: Vec<Subject>,
    pub total_marks: f64,
}

#[derive(Debug, Error)]
pub enum MarkStoreError {
    #[error(
        "marks for {exam_type} exam already exist for this student in year {academic_year} semester {semester}"
    )]
    Duplicate {
        exam_type: ExamType,
        academic_year: i64,
        semester: i64,
    },
    #[error("student not found: {0}")]
    StudentNotFound(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// Read access the CA computation needs from wherever mark records live.
pub trait MarkRecordStore {
    fn find_mark_records(
        &self,
        student_id: &str,
        academic_year: i64,
    ) -> anyhow::Result<Vec<MarkRecord>>;
}

const MARK_COLUMNS: &str =
    "id, student_id, academic_year, semester, exam_type, total_marks, created_at, updated_at";

pub struct SqliteMarkStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMarkStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Inserts a sitting. The unique index on
    /// (student, year, semester, exam type) decides conflicts atomically.
    pub fn insert(&self, new: &NewMarkRecord) -> Result<MarkRecord, MarkStoreError> {
        let student_exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ?",
                [&new.student_id],
                |r| r.get(0),
            )
            .optional()?;
        if student_exists.is_none() {
            return Err(MarkStoreError::StudentNotFound(new.student_id.clone()));
        }

        let id = Uuid::new_v4().to_string();
        let now = db::now_timestamp();

        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO marks(id, student_id, academic_year, semester, exam_type, total_marks, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &id,
                &new.student_id,
                new.academic_year,
                new.semester,
                new.exam_type,
                new.total_marks,
                &now,
                &now
            ],
        );
        if let Err(e) = inserted {
            if db::is_unique_violation(&e) {
                return Err(MarkStoreError::Duplicate {
                    exam_type: new.exam_type,
                    academic_year: new.academic_year,
                    semester: new.semester,
                });
            }
            return Err(e.into());
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO mark_subjects(mark_id, idx, code, name, marks) VALUES(?, ?, ?, ?, ?)",
            )?;
            for (i, s) in new.subjects.iter().enumerate() {
                stmt.execute(rusqlite::params![&id, i as i64, &s.code, &s.name, s.marks])?;
            }
        }
        tx.commit()?;

        Ok(MarkRecord {
            id,
            student_id: new.student_id.clone(),
            academic_year: new.academic_year,
            semester: new.semester,
            exam_type: new.exam_type,
            subjects: new.subjects.clone(),
            total_marks: new.total_marks,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// A student's sittings, oldest year first.
    pub fn list_for_student(&self, student_id: &str) -> rusqlite::Result<Vec<MarkRecord>> {
        self.load(
            &format!(
                "SELECT {MARK_COLUMNS} FROM marks WHERE student_id = ?
                 ORDER BY academic_year, semester, exam_type"
            ),
            &[&student_id],
        )
    }

    /// Every sitting, newest year first.
    pub fn list_all(&self) -> rusqlite::Result<Vec<MarkRecord>> {
        self.load(
            &format!(
                "SELECT {MARK_COLUMNS} FROM marks
                 ORDER BY academic_year DESC, semester DESC, created_at DESC"
            ),
            &[],
        )
    }

    fn load(&self, sql: &str, params: &[&dyn ToSql]) -> rusqlite::Result<Vec<MarkRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut records = stmt
            .query_map(params, read_mark_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut subj_stmt = self
            .conn
            .prepare("SELECT code, name, marks FROM mark_subjects WHERE mark_id = ? ORDER BY idx")?;
        for rec in records.iter_mut() {
            rec.subjects = subj_stmt
                .query_map([&rec.id], |r| {
                    Ok(Subject {
                        code: r.get(0)?,
                        name: r.get(1)?,
                        marks: r.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }
        Ok(records)
    }
}

impl MarkRecordStore for SqliteMarkStore<'_> {
    fn find_mark_records(
        &self,
        student_id: &str,
        academic_year: i64,
    ) -> anyhow::Result<Vec<MarkRecord>> {
        let records = self.load(
            &format!(
                "SELECT {MARK_COLUMNS} FROM marks WHERE student_id = ? AND academic_year = ?
                 ORDER BY semester, exam_type"
            ),
            &[&student_id, &academic_year],
        )?;
        Ok(records)
    }
}

fn read_mark_row(row: &Row<'_>) -> rusqlite::Result<MarkRecord> {
    Ok(MarkRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        academic_year: row.get(2)?,
        semester: row.get(3)?,
        exam_type: row.get(4)?,
        subjects: Vec::new(),
        total_marks: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
