//! Input validation helpers and the optional-field patch type.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{Error, Result};

/// One field of a partial update.
///
/// A field missing from the request body, or sent as `null`, is `Absent` and
/// leaves the column untouched. Use with `#[serde(default)]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    #[default]
    Absent,
    Set(T),
}

impl<T> Patch<T> {
    pub fn as_set(&self) -> Option<&T> {
        match self {
            Patch::Set(value) => Some(value),
            Patch::Absent => None,
        }
    }
}

impl Patch<String> {
    /// Treat an empty string as not provided.
    pub fn non_empty(self) -> Patch<String> {
        match self {
            Patch::Set(value) if value.is_empty() => Patch::Absent,
            other => other,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Patch::Set(value),
            None => Patch::Absent,
        })
    }
}

/// Fail with `message` unless every value is non-empty.
///
/// Values are checked as given; callers trim the fields that are stored trimmed.
pub fn require_present(values: &[&str], message: &str) -> Result<()> {
    if values.iter().any(|v| v.is_empty()) {
        return Err(Error::Validation(message.to_string()));
    }
    Ok(())
}

/// Canonical form of an email address: trimmed and lower-cased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Read an integer id that may arrive as a JSON number or a numeric string.
///
/// Returns `None` for null, empty strings and anything that is not an integer.
pub fn id_from_value(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// True when a JSON value counts as "not provided".
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Parse an id taken from the query string or body.
pub fn parse_id(raw: &str, message: &str) -> Result<i32> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Validation(message.to_string()))
}

/// Parse an optional `YYYY-MM-DD` date; an empty string reads as absent.
pub fn parse_date(raw: Option<&str>, field: &str) -> Result<Option<NaiveDate>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| Error::Validation(format!("Invalid {}: expected YYYY-MM-DD", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Update {
        #[serde(default)]
        title: Patch<String>,
        #[serde(default)]
        content: Patch<String>,
    }

    #[test]
    fn test_patch_presence() {
        let update: Update = serde_json::from_value(json!({ "content": "" })).unwrap();
        assert_eq!(update.title, Patch::Absent);
        assert_eq!(update.content, Patch::Set(String::new()));

        let update: Update = serde_json::from_value(json!({ "title": null })).unwrap();
        assert_eq!(update.title, Patch::Absent);
    }

    #[test]
    fn test_non_empty_drops_blank_strings() {
        assert_eq!(Patch::Set(String::new()).non_empty(), Patch::Absent);
        assert_eq!(
            Patch::Set("Plan".to_string()).non_empty(),
            Patch::Set("Plan".to_string())
        );
    }

    #[test]
    fn test_require_present() {
        assert!(require_present(&["a", "b"], "both required").is_ok());
        let err = require_present(&["a", ""], "both required").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_string(), "both required");

        // Whitespace is a value; only empty strings are missing.
        assert!(require_present(&["a", "  "], "both required").is_ok());
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ivan.Petrov@Example.RU "), "ivan.petrov@example.ru");
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(id_from_value(&json!(7)), Some(7));
        assert_eq!(id_from_value(&json!("12")), Some(12));
        assert_eq!(id_from_value(&json!("abc")), None);
        assert_eq!(id_from_value(&json!(null)), None);
        assert_eq!(id_from_value(&json!(1.5)), None);
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date(None, "planned_date").unwrap(), None);
        assert_eq!(parse_date(Some(""), "planned_date").unwrap(), None);
        assert_eq!(
            parse_date(Some("2024-03-15"), "planned_date").unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert!(parse_date(Some("15.03.2024"), "planned_date").is_err());
    }
}
