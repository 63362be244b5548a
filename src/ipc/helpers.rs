use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn db(code: &'static str, e: impl ToString) -> Self {
        Self::new(code, e.to_string())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub type Handler = fn(&Connection, &Value) -> Result<Value, HandlerErr>;

pub fn run_with_db(state: &AppState, req: &Request, handler: Handler) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match handler(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

/// Present means non-null and, for strings, non-blank after trimming.
pub fn is_present(params: &Value, key: &str) -> bool {
    match params.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Err(HandlerErr::bad_params(format!("missing {key}"))),
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                Err(HandlerErr::bad_params(format!("{key} must not be empty")))
            } else {
                Ok(t.to_string())
            }
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a string"))),
    }
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a string"))),
    }
}

pub fn max_chars(key: &str, value: &str, max: usize) -> Result<(), HandlerErr> {
    if value.chars().count() > max {
        return Err(HandlerErr::bad_params(format!(
            "{key} cannot exceed {max} characters"
        )));
    }
    Ok(())
}

/// Accepts JSON numbers and numeric strings; rejects fractions.
pub fn required_int_in(params: &Value, key: &str, min: i64, max: i64) -> Result<i64, HandlerErr> {
    let parsed = match params.get(key) {
        None | Some(Value::Null) => {
            return Err(HandlerErr::bad_params(format!("missing {key}")));
        }
        Some(Value::Number(n)) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    let Some(v) = parsed else {
        return Err(HandlerErr::bad_params(format!("{key} must be an integer")));
    };
    if v < min || v > max {
        return Err(
            HandlerErr::bad_params(format!("{key} must be between {min} and {max}"))
                .with_details(json!({ "field": key, "value": v })),
        );
    }
    Ok(v)
}

pub fn parse_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

pub fn number_in(key: &str, value: &Value, min: f64, max: f64) -> Result<f64, HandlerErr> {
    let Some(v) = parse_number(value) else {
        return Err(HandlerErr::bad_params(format!("{key} must be a number")));
    };
    if v < min || v > max {
        return Err(
            HandlerErr::bad_params(format!("{key} must be between {min} and {max}"))
                .with_details(json!({ "field": key, "value": v })),
        );
    }
    Ok(v)
}

pub fn one_of(key: &str, raw: &str, allowed: &[&'static str]) -> Result<&'static str, HandlerErr> {
    allowed.iter().copied().find(|a| *a == raw).ok_or_else(|| {
        HandlerErr::bad_params(format!("{key} must be one of: {}", allowed.join(", ")))
            .with_details(json!({ "field": key, "value": raw }))
    })
}

/// Normalizes to `YYYY-MM-DD`. RFC 3339 timestamps keep only their date.
pub fn parse_date(key: &str, raw: &str) -> Result<String, HandlerErr> {
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.date_naive().format("%Y-%m-%d").to_string());
    }
    Err(HandlerErr::bad_params(format!("{key} must be a date (YYYY-MM-DD)")))
}

/// Word characters joined by single `.` or `-` separators, never leading,
/// trailing or doubled.
fn separated_words(part: &str) -> bool {
    let word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut prev_word = false;
    for c in part.chars() {
        if word(c) {
            prev_word = true;
        } else if (c == '.' || c == '-') && prev_word {
            prev_word = false;
        } else {
            return false;
        }
    }
    prev_word
}

/// `local@domain.tld` with a 2-3 character alphanumeric top-level label.
pub fn is_valid_email(raw: &str) -> bool {
    let Some((local, domain)) = raw.split_once('@') else {
        return false;
    };
    if !separated_words(local) || !separated_words(domain) {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((_, tld)) => {
            (2..=3).contains(&tld.len()) && tld.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}
