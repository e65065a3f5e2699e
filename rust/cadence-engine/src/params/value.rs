//! Parameter values and rendering hints.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// A value bound into a query template.
///
/// Deserialises from plain JSON: `null`, booleans, numbers, strings and
/// arrays. Strings in `YYYY-MM-DDTHH:MM:SS` form deserialise as dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Date(NaiveDateTime),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Short type label used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::Date(_) => "date",
            Self::Text(_) => "string",
            Self::List(_) => "array",
        }
    }

    /// Visit every string carried by this value, including array elements.
    pub fn for_each_text(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::Text(text) => f(text),
            Self::List(items) => items.iter().for_each(|item| item.for_each_text(f)),
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::Date(_) => {}
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<u64> for ParamValue {
    fn from(value: u64) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<NaiveDateTime> for ParamValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value.and_time(NaiveTime::MIN))
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Text,
    Date,
    Number,
    Boolean,
    Array,
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Text => "string",
            Self::Date => "date",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
        })
    }
}

/// How an array value is rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayBinding {
    /// `('a','b')`, for `IN` predicates.
    #[default]
    InList,
    /// `VALUES ('a'),('b')`, for joining against an inline table.
    Values,
}

/// Rendering hints for one parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamHint {
    /// Declared type; inferred from the value when absent.
    #[serde(default, rename = "type")]
    pub param_type: Option<ParamType>,
    /// Array rendering form.
    #[serde(default)]
    pub array: ArrayBinding,
    /// Treat the value as a `LIKE` pattern even without a `LIKE` keyword.
    #[serde(default)]
    pub pattern: bool,
}

impl ParamHint {
    #[must_use]
    pub const fn typed(param_type: ParamType) -> Self {
        Self {
            param_type: Some(param_type),
            array: ArrayBinding::InList,
            pattern: false,
        }
    }

    #[must_use]
    pub const fn values_table() -> Self {
        Self {
            param_type: Some(ParamType::Array),
            array: ArrayBinding::Values,
            pattern: false,
        }
    }

    #[must_use]
    pub const fn like_pattern() -> Self {
        Self {
            param_type: Some(ParamType::Text),
            array: ArrayBinding::InList,
            pattern: true,
        }
    }
}

/// Parse a string as a date-time, dropping any zone suffix.
///
/// Accepts RFC 3339 (`2025-02-08T00:00:00Z`, `...+02:00`), naive
/// `YYYY-MM-DDTHH:MM:SS` (optionally with a space separator), and bare
/// `YYYY-MM-DD`.
pub(crate) fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN))
}

/// Parse a string only if it carries an explicit zone (RFC 3339).
pub(crate) fn parse_zoned_text(text: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.naive_local())
}
