use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::marks::{ExamType, MarkRecord, MarkRecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sitting {
    pub semester: i64,
    pub exam_type: ExamType,
}

impl Sitting {
    pub const fn new(semester: i64, exam_type: ExamType) -> Self {
        Self {
            semester,
            exam_type,
        }
    }

    fn matches(&self, record: &MarkRecord) -> bool {
        record.semester == self.semester && record.exam_type == self.exam_type
    }
}

impl fmt::Display for Sitting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "semester {} {}", self.semester, self.exam_type)
    }
}

/// The four sittings a CA mark is built from, each with its weight in
/// percent. Finals outweigh mid-terms and semester 2 outweighs semester 1.
pub const CA_SITTINGS: [(Sitting, u32); 4] = [
    (Sitting::new(1, ExamType::Mid), 10),
    (Sitting::new(1, ExamType::Final), 15),
    (Sitting::new(2, ExamType::Mid), 15),
    (Sitting::new(2, ExamType::Final), 60),
];

pub const CA_WEIGHT_TOTAL: u32 = 100;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("all mid and final marks for both semesters are required to calculate CA marks")]
    MissingPrerequisiteData { missing: Vec<Sitting> },
    #[error("mark record {record_id} ({sitting}) cannot be averaged: {reason}")]
    InvalidRecordState {
        record_id: String,
        sitting: Sitting,
        reason: &'static str,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SittingAverages {
    pub sem1_mid: f64,
    pub sem1_final: f64,
    pub sem2_mid: f64,
    pub sem2_final: f64,
}

impl SittingAverages {
    /// Ordered like `CA_SITTINGS`.
    fn as_array(&self) -> [f64; 4] {
        [self.sem1_mid, self.sem1_final, self.sem2_mid, self.sem2_final]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaResult {
    pub student_id: String,
    pub academic_year: i64,
    pub ca_marks: i64,
    pub averages: SittingAverages,
}

/// Half-up rounding to an integer. Inputs are never negative, so rounding
/// halves away from zero is the same thing.
pub fn round_half_up(x: f64) -> i64 {
    x.round() as i64
}

/// Mean subject mark of a sitting, from the stored total.
pub fn record_average(record: &MarkRecord) -> Result<f64, CaError> {
    let invalid = |reason| CaError::InvalidRecordState {
        record_id: record.id.clone(),
        sitting: Sitting::new(record.semester, record.exam_type),
        reason,
    };
    if record.subjects.is_empty() {
        return Err(invalid("record has no subjects"));
    }
    if !record.total_marks.is_finite() {
        return Err(invalid("total marks is not a finite number"));
    }
    Ok(record.total_marks / record.subjects.len() as f64)
}

/// Weighted CA percentage. Weights are integer percentages so a combined
/// value of exactly `x.5` is computed exactly before rounding.
pub fn weighted_ca_marks(averages: &SittingAverages) -> i64 {
    let weighted: f64 = CA_SITTINGS
        .iter()
        .zip(averages.as_array())
        .map(|((_, weight), avg)| avg * f64::from(*weight))
        .sum();
    round_half_up(weighted / f64::from(CA_WEIGHT_TOTAL))
}

/// Pure CA computation over the records of one student and year.
pub fn ca_from_records(
    student_id: &str,
    academic_year: i64,
    records: &[MarkRecord],
) -> Result<CaResult, CaError> {
    let found: Vec<Option<&MarkRecord>> = CA_SITTINGS
        .iter()
        .map(|(sitting, _)| records.iter().find(|r| sitting.matches(r)))
        .collect();

    let missing: Vec<Sitting> = CA_SITTINGS
        .iter()
        .zip(found.iter())
        .filter(|(_, rec)| rec.is_none())
        .map(|((sitting, _), _)| *sitting)
        .collect();
    if !missing.is_empty() {
        return Err(CaError::MissingPrerequisiteData { missing });
    }

    let mut avgs = [0.0_f64; 4];
    for (slot, rec) in avgs.iter_mut().zip(found.into_iter().flatten()) {
        *slot = record_average(rec)?;
    }
    let averages = SittingAverages {
        sem1_mid: avgs[0],
        sem1_final: avgs[1],
        sem2_mid: avgs[2],
        sem2_final: avgs[3],
    };

    Ok(CaResult {
        student_id: student_id.to_string(),
        academic_year,
        ca_marks: weighted_ca_marks(&averages),
        averages,
    })
}

/// Reads the student's sittings for the year once and computes the CA mark.
/// Nothing is persisted; every call recomputes from the store.
pub fn compute_ca_marks<S>(
    store: &S,
    student_id: &str,
    academic_year: i64,
) -> Result<CaResult, CaError>
where
    S: MarkRecordStore + ?Sized,
{
    let records = store.find_mark_records(student_id, academic_year)?;
    ca_from_records(student_id, academic_year, &records)
}
