//! Parameter substitution for query templates.
//!
//! [`bind`] replaces placeholders with escaped SQL literals. It is a pure
//! function: the same template, values and hints always give the same
//! output, and binding an already fully bound query changes nothing.
//!
//! Rendering rules:
//!
//! - strings are single-quoted with `'` doubled
//! - dates render as `'YYYY-MM-DDTHH:MM:SS'` without a zone suffix
//! - booleans render as `TRUE`/`FALSE`, null as `NULL`
//! - arrays render as `('a','b')` or, when hinted, `VALUES ('a'),('b')`
//! - placeholders already inside a quoted literal render only their
//!   escaped inner text
//! - `LIKE`/`ILIKE` operands get `%...%` unless the template supplies `%`
//!
//! Placeholders without a value are left in place and reported in
//! [`BoundQuery::unbound`] so the executor can receive them as declared
//! parameters.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_engine::params::{bind, ParamValue};
//!
//! let values = BTreeMap::from([("asins".to_string(), ParamValue::from(vec!["B001", "B002"]))]);
//! let bound = bind("SELECT * FROM t WHERE asin IN {{asins}}", &values, &BTreeMap::new())?;
//! assert_eq!(bound.sql, "SELECT * FROM t WHERE asin IN ('B001','B002')");
//! ```

pub mod firewall;
pub mod placeholder;
pub mod value;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::window::DateWindow;

pub use placeholder::{Occurrence, PlaceholderSyntax, Segment, detect_placeholders, scan};
pub use value::{ArrayBinding, ParamHint, ParamType, ParamValue};

use value::{parse_date_text, parse_zoned_text};

/// Largest array accepted in `IN`-list form.
pub const MAX_IN_LIST_ELEMENTS: usize = 1_000;

/// Name of the parameter bound to a window's inclusive start.
pub const START_DATE_PARAM: &str = "start_date";
/// Name of the parameter bound to a window's exclusive end.
pub const END_DATE_PARAM: &str = "end_date";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// `start_date`/`end_date` values for a query window.
#[must_use]
pub fn window_values(window: &DateWindow) -> BTreeMap<String, ParamValue> {
    BTreeMap::from([
        (START_DATE_PARAM.to_string(), ParamValue::Date(window.start)),
        (END_DATE_PARAM.to_string(), ParamValue::Date(window.end)),
    ])
}

/// Errors from parameter binding. All are validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("parameter '{parameter}' contains blocked statement keyword {keyword}")]
    UnsafeValue { parameter: String, keyword: String },

    #[error("parameter '{parameter}' has {len} elements; IN lists are limited to {max}")]
    ArrayTooLarge {
        parameter: String,
        len: usize,
        max: usize,
    },

    #[error("parameter '{parameter}' is declared {expected} but the value is {found}")]
    TypeMismatch {
        parameter: String,
        expected: ParamType,
        found: String,
    },

    #[error("parameter '{parameter}' contains a nested array")]
    NestedArray { parameter: String },

    #[error("parameter '{parameter}' contains template placeholder {placeholder}")]
    EmbeddedPlaceholder {
        parameter: String,
        placeholder: String,
    },
}

/// Result of binding a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundQuery {
    /// SQL with every supplied value substituted.
    pub sql: String,
    /// Placeholders that received a value.
    pub bound: BTreeSet<String>,
    /// Placeholders left in place for lack of a value.
    pub unbound: BTreeSet<String>,
}

impl BoundQuery {
    #[must_use]
    pub fn is_fully_bound(&self) -> bool {
        self.unbound.is_empty()
    }

    /// Unbound names, for the executor's declared-parameter list.
    #[must_use]
    pub fn declared_parameters(&self) -> Vec<String> {
        self.unbound.iter().cloned().collect()
    }
}

/// Bind `values` into `template`.
pub fn bind(
    template: &str,
    values: &BTreeMap<String, ParamValue>,
    hints: &BTreeMap<String, ParamHint>,
) -> Result<BoundQuery, BindError> {
    for (name, value) in values {
        firewall::check_value(name, value)?;
        reject_embedded_placeholders(name, value)?;
    }

    let mut sql = String::with_capacity(template.len());
    let mut bound = BTreeSet::new();
    let mut unbound = BTreeSet::new();

    for segment in scan(template) {
        match segment {
            Segment::Text(text) => sql.push_str(text),
            Segment::Placeholder(occurrence) => match values.get(occurrence.name) {
                Some(value) => {
                    let hint = hints.get(occurrence.name).copied().unwrap_or_default();
                    let context = RenderContext::at(template, &occurrence, &hint);
                    sql.push_str(&render(occurrence.name, value, &hint, &context)?);
                    bound.insert(occurrence.name.to_string());
                }
                None => {
                    sql.push_str(&template[occurrence.start..occurrence.end]);
                    unbound.insert(occurrence.name.to_string());
                }
            },
        }
    }

    Ok(BoundQuery {
        sql,
        bound,
        unbound,
    })
}

/// `{{ name }}` is recognised inside literals, so a value carrying one
/// would turn into a placeholder in the bound output.
fn reject_embedded_placeholders(name: &str, value: &ParamValue) -> Result<(), BindError> {
    let mut embedded = None;
    value.for_each_text(&mut |text| {
        if embedded.is_some() {
            return;
        }
        embedded = scan(text).into_iter().find_map(|segment| match segment {
            Segment::Placeholder(o) if o.syntax == PlaceholderSyntax::Braces => {
                Some(text[o.start..o.end].to_string())
            }
            _ => None,
        });
    });
    match embedded {
        Some(placeholder) => Err(BindError::EmbeddedPlaceholder {
            parameter: name.to_string(),
            placeholder,
        }),
        None => Ok(()),
    }
}

/// Where in the template a placeholder sits.
#[derive(Debug, Clone, Copy, Default)]
struct RenderContext {
    in_literal: bool,
    like: bool,
    template_wildcards: bool,
}

impl RenderContext {
    fn at(template: &str, occurrence: &Occurrence<'_>, hint: &ParamHint) -> Self {
        let before_operand = &template[..occurrence.literal_start.unwrap_or(occurrence.start)];
        Self {
            in_literal: occurrence.in_literal(),
            like: hint.pattern || preceded_by_like(before_operand),
            template_wildcards: template[..occurrence.start].ends_with('%')
                || template[occurrence.end..].starts_with('%'),
        }
    }

    fn finish(self, literal: Literal) -> String {
        match literal {
            Literal::Null if self.in_literal => String::new(),
            Literal::Null => "NULL".to_string(),
            Literal::Bare(text) => text,
            Literal::Quoted(mut text) => {
                if self.like && !self.template_wildcards {
                    text = format!("%{text}%");
                }
                let escaped = text.replace('\'', "''");
                if self.in_literal {
                    escaped
                } else {
                    format!("'{escaped}'")
                }
            }
        }
    }
}

fn preceded_by_like(text: &str) -> bool {
    let word = text
        .trim_end()
        .rsplit(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default();
    word.eq_ignore_ascii_case("like") || word.eq_ignore_ascii_case("ilike")
}

enum Literal {
    Null,
    /// Rendered verbatim.
    Bare(String),
    /// Unescaped text that becomes a quoted string.
    Quoted(String),
}

fn render(
    name: &str,
    value: &ParamValue,
    hint: &ParamHint,
    context: &RenderContext,
) -> Result<String, BindError> {
    match (value, hint.param_type) {
        (ParamValue::List(items), _) => render_list(name, items, hint.array),
        (scalar, Some(ParamType::Array)) => {
            render_list(name, std::slice::from_ref(scalar), hint.array)
        }
        (scalar, declared) => Ok(context.finish(scalar_literal(name, scalar, declared)?)),
    }
}

fn render_list(name: &str, items: &[ParamValue], binding: ArrayBinding) -> Result<String, BindError> {
    let elements = items
        .iter()
        .map(|item| match item {
            ParamValue::List(_) => Err(BindError::NestedArray {
                parameter: name.to_string(),
            }),
            scalar => Ok(RenderContext::default().finish(scalar_literal(name, scalar, None)?)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match binding {
        ArrayBinding::InList => {
            if elements.len() > MAX_IN_LIST_ELEMENTS {
                return Err(BindError::ArrayTooLarge {
                    parameter: name.to_string(),
                    len: elements.len(),
                    max: MAX_IN_LIST_ELEMENTS,
                });
            }
            if elements.is_empty() {
                "(NULL)".to_string()
            } else {
                format!("({})", elements.join(","))
            }
        }
        ArrayBinding::Values => {
            if elements.is_empty() {
                "VALUES (NULL)".to_string()
            } else {
                let rows: Vec<String> = elements.iter().map(|e| format!("({e})")).collect();
                format!("VALUES {}", rows.join(","))
            }
        }
    })
}

fn scalar_literal(
    name: &str,
    value: &ParamValue,
    declared: Option<ParamType>,
) -> Result<Literal, BindError> {
    let mismatch = |expected: ParamType| BindError::TypeMismatch {
        parameter: name.to_string(),
        expected,
        found: value.type_name().to_string(),
    };
    let date = |dt: &chrono::NaiveDateTime| Literal::Quoted(dt.format(DATE_FORMAT).to_string());

    Ok(match (declared, value) {
        (_, ParamValue::Null) => Literal::Null,
        (_, ParamValue::List(_)) => {
            return Err(BindError::NestedArray {
                parameter: name.to_string(),
            });
        }

        (Some(ParamType::Date), ParamValue::Date(dt)) | (None, ParamValue::Date(dt)) => date(dt),
        (Some(ParamType::Date), ParamValue::Text(text)) => {
            let dt = parse_date_text(text).ok_or_else(|| mismatch(ParamType::Date))?;
            date(&dt)
        }
        (Some(ParamType::Date), _) => return Err(mismatch(ParamType::Date)),

        (Some(ParamType::Number), ParamValue::Number(n)) | (None, ParamValue::Number(n)) => {
            Literal::Bare(n.to_string())
        }
        (Some(ParamType::Number), ParamValue::Text(text)) => {
            let trimmed = text.trim();
            match trimmed.parse::<f64>() {
                Ok(n) if n.is_finite() => Literal::Bare(trimmed.to_string()),
                _ => return Err(mismatch(ParamType::Number)),
            }
        }
        (Some(ParamType::Number), _) => return Err(mismatch(ParamType::Number)),

        (Some(ParamType::Boolean), ParamValue::Bool(b)) | (None, ParamValue::Bool(b)) => {
            Literal::Bare(if *b { "TRUE" } else { "FALSE" }.to_string())
        }
        (Some(ParamType::Boolean), ParamValue::Text(text)) => {
            match text.trim().to_ascii_lowercase().as_str() {
                "true" => Literal::Bare("TRUE".to_string()),
                "false" => Literal::Bare("FALSE".to_string()),
                _ => return Err(mismatch(ParamType::Boolean)),
            }
        }
        (Some(ParamType::Boolean), _) => return Err(mismatch(ParamType::Boolean)),

        (Some(ParamType::Text | ParamType::Array), ParamValue::Text(text)) => {
            Literal::Quoted(text.clone())
        }
        (Some(ParamType::Text | ParamType::Array), ParamValue::Number(n)) => {
            Literal::Quoted(n.to_string())
        }
        (Some(ParamType::Text | ParamType::Array), ParamValue::Bool(b)) => {
            Literal::Quoted(b.to_string())
        }
        (Some(ParamType::Text | ParamType::Array), ParamValue::Date(dt)) => date(dt),

        (None, ParamValue::Text(text)) => match parse_zoned_text(text) {
            Some(dt) => date(&dt),
            None => Literal::Quoted(text.clone()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn values(pairs: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn bind_plain(template: &str, pairs: &[(&str, ParamValue)]) -> Result<BoundQuery, BindError> {
        bind(template, &values(pairs), &BTreeMap::new())
    }

    #[test]
    fn test_in_list_scenario() {
        let bound = bind_plain(
            "SELECT * FROM t WHERE asin IN {{asins}}",
            &[("asins", ParamValue::from(vec!["B001", "B002"]))],
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE asin IN ('B001','B002')");
        assert!(bound.is_fully_bound());
    }

    #[test]
    fn test_scalar_rendering() {
        let start = NaiveDate::from_ymd_opt(2025, 2, 8)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let bound = bind_plain(
            "SELECT :s, :d, :n, :b, :z",
            &[
                ("s", ParamValue::from("O'Brien")),
                ("d", ParamValue::from(start)),
                ("n", ParamValue::from(42_i64)),
                ("b", ParamValue::from(false)),
                ("z", ParamValue::Null),
            ],
        )
        .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT 'O''Brien', '2025-02-08T00:00:00', 42, FALSE, NULL"
        );
    }

    #[test]
    fn test_zoned_strings_normalised_to_dates() {
        let bound = bind_plain(
            "WHERE ts >= $since",
            &[("since", ParamValue::from("2025-02-08T06:30:00Z"))],
        )
        .unwrap();
        assert_eq!(bound.sql, "WHERE ts >= '2025-02-08T06:30:00'");
    }

    #[test]
    fn test_declared_date_from_plain_date_string() {
        let hints = BTreeMap::from([("d".to_string(), ParamHint::typed(ParamType::Date))]);
        let bound = bind("WHERE day = :d", &values(&[("d", ParamValue::from("2025-02-08"))]), &hints)
            .unwrap();
        assert_eq!(bound.sql, "WHERE day = '2025-02-08T00:00:00'");

        let err = bind("WHERE day = :d", &values(&[("d", ParamValue::from("soon"))]), &hints)
            .unwrap_err();
        assert!(matches!(err, BindError::TypeMismatch { expected: ParamType::Date, .. }));
    }

    #[test]
    fn test_declared_number_and_boolean_from_text() {
        let hints = BTreeMap::from([
            ("n".to_string(), ParamHint::typed(ParamType::Number)),
            ("b".to_string(), ParamHint::typed(ParamType::Boolean)),
        ]);
        let bound = bind(
            "LIMIT :n -- :b",
            &values(&[("n", ParamValue::from(" 25 ")), ("b", ParamValue::from("True"))]),
            &hints,
        )
        .unwrap();
        assert_eq!(bound.sql, "LIMIT 25 -- TRUE");

        let err = bind("LIMIT :n", &values(&[("n", ParamValue::from("1; --"))]), &hints)
            .unwrap_err();
        assert!(matches!(err, BindError::TypeMismatch { .. }));
    }

    #[test]
    fn test_placeholder_inside_literal_renders_inner_text() {
        let bound = bind_plain(
            "SELECT * FROM t WHERE name = 'prefix-{{suffix}}'",
            &[("suffix", ParamValue::from("it's"))],
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE name = 'prefix-it''s'");
    }

    #[test]
    fn test_like_wrapping() {
        let term = [("term", ParamValue::from("shoe"))];
        assert_eq!(
            bind_plain("WHERE title LIKE :term", &term).unwrap().sql,
            "WHERE title LIKE '%shoe%'"
        );
        assert_eq!(
            bind_plain("WHERE title not ilike {{term}}", &term).unwrap().sql,
            "WHERE title not ilike '%shoe%'"
        );
        assert_eq!(
            bind_plain("WHERE title LIKE '%{{term}}%'", &term).unwrap().sql,
            "WHERE title LIKE '%shoe%'"
        );
        assert_eq!(
            bind_plain("WHERE title LIKE '{{term}}%'", &term).unwrap().sql,
            "WHERE title LIKE 'shoe%'"
        );
        assert_eq!(
            bind_plain("WHERE title = :term", &term).unwrap().sql,
            "WHERE title = 'shoe'"
        );

        let hints = BTreeMap::from([("term".to_string(), ParamHint::like_pattern())]);
        assert_eq!(
            bind("WHERE contains(title, :term)", &values(&term), &hints).unwrap().sql,
            "WHERE contains(title, '%shoe%')"
        );
    }

    #[test]
    fn test_array_forms() {
        assert_eq!(
            bind_plain("WHERE a IN :xs", &[("xs", ParamValue::List(vec![]))])
                .unwrap()
                .sql,
            "WHERE a IN (NULL)"
        );

        let hints = BTreeMap::from([("xs".to_string(), ParamHint::values_table())]);
        let bound = bind(
            "SELECT * FROM ({{xs}}) AS v(id)",
            &values(&[("xs", ParamValue::from(vec![1_i64, 2]))]),
            &hints,
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM (VALUES (1),(2)) AS v(id)");
    }

    #[test]
    fn test_array_limits() {
        let big: Vec<i64> = (0..1_001).collect();
        let err = bind_plain("WHERE a IN :xs", &[("xs", ParamValue::from(big))]).unwrap_err();
        assert_eq!(
            err,
            BindError::ArrayTooLarge {
                parameter: "xs".to_string(),
                len: 1_001,
                max: MAX_IN_LIST_ELEMENTS,
            }
        );

        let exact: Vec<i64> = (0..1_000).collect();
        assert!(bind_plain("WHERE a IN :xs", &[("xs", ParamValue::from(exact))]).is_ok());

        let nested = ParamValue::List(vec![ParamValue::from(vec!["a"])]);
        assert!(matches!(
            bind_plain("WHERE a IN :xs", &[("xs", nested)]),
            Err(BindError::NestedArray { .. })
        ));
    }

    #[test]
    fn test_missing_values_reported_and_left_in_place() {
        let bound = bind_plain(
            "WHERE a = :a AND b = {{ b }} AND c = $c",
            &[("a", ParamValue::from(1_i64))],
        )
        .unwrap();
        assert_eq!(bound.sql, "WHERE a = 1 AND b = {{ b }} AND c = $c");
        assert_eq!(bound.declared_parameters(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(bound.bound, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn test_unsafe_value_rejected_whichever_parameter_carries_it() {
        let template = "SELECT * FROM t WHERE a = :a AND b = :b";
        for carrier in ["a", "b", "unused"] {
            let err = bind_plain(
                template,
                &[
                    ("a", ParamValue::from("fine")),
                    ("b", ParamValue::from("fine")),
                    (carrier, ParamValue::from("x'; DROP TABLE users; --")),
                ],
            )
            .unwrap_err();
            assert_eq!(
                err,
                BindError::UnsafeValue {
                    parameter: carrier.to_string(),
                    keyword: "DROP".to_string(),
                }
            );
        }
    }

    #[test]
    fn test_bind_idempotent_and_redetection_empty() {
        let template =
            "SELECT * FROM sales WHERE d >= :start_date AND d < :end_date AND sku IN {{skus}} AND note LIKE $q";
        let vals = values(&[
            ("start_date", ParamValue::from("2025-02-08T00:00:00")),
            ("end_date", ParamValue::from("2025-02-15T00:00:00")),
            ("skus", ParamValue::from(vec!["A:1", "B$2"])),
            ("q", ParamValue::from("50% off")),
        ]);
        let first = bind(template, &vals, &BTreeMap::new()).unwrap();
        let second = bind(template, &vals, &BTreeMap::new()).unwrap();
        assert_eq!(first, second);

        assert!(detect_placeholders(&first.sql).is_empty());
        let rebound = bind(&first.sql, &vals, &BTreeMap::new()).unwrap();
        assert_eq!(rebound.sql, first.sql);

        // values that would reintroduce a placeholder are refused
        let err = bind_plain("SELECT :note", &[("note", ParamValue::from("hello {{world}}"))]).unwrap_err();
        assert_eq!(
            err,
            BindError::EmbeddedPlaceholder {
                parameter: "note".to_string(),
                placeholder: "{{world}}".to_string(),
            }
        );
        let err = bind_plain("SELECT {{tags}}", &[("tags", ParamValue::from(vec!["ok", "{{ x }}"]))]).unwrap_err();
        assert!(matches!(err, BindError::EmbeddedPlaceholder { .. }));
        // sigils and malformed braces in values stay plain text
        let bound = bind_plain("SELECT :note", &[("note", ParamValue::from("{{not valid}} :x $y"))]).unwrap();
        assert!(detect_placeholders(&bound.sql).is_empty());
    }

    #[test]
    fn test_casts_survive_binding() {
        let bound = bind_plain(
            "SELECT :d::date, 'a:b'",
            &[("d", ParamValue::from("2025-02-08"))],
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT '2025-02-08'::date, 'a:b'");
    }
}
