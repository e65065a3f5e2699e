//! Statement-shaped keyword screening for parameter values.
//!
//! Values are rendered as escaped literals, so this is a second line of
//! defence: it rejects values that *look like* a destructive statement
//! (`DROP TABLE`, an unscoped `DELETE FROM`, `GRANT SELECT`, ...). Bare
//! words such as a product called "Drop Cloth" pass. Template text is
//! never screened.

use std::sync::LazyLock;

use regex::Regex;

use super::{BindError, ParamValue};

struct Rule {
    keyword: &'static str,
    pattern: Regex,
    /// Matches followed by a `WHERE` clause are allowed.
    scoped_by_where: bool,
}

fn rule(keyword: &'static str, pattern: &str, scoped_by_where: bool) -> Rule {
    Rule {
        keyword,
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid firewall pattern: {e}")),
        scoped_by_where,
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        rule(
            "DROP",
            r"(?i)\bDROP\s+(TABLE|VIEW|SCHEMA|DATABASE|INDEX|FUNCTION|PROCEDURE|USER|ROLE|SEQUENCE|TRIGGER)\b",
            false,
        ),
        rule("DELETE", r"(?i)\bDELETE\s+FROM\s+\S+", true),
        rule("UPDATE", r"(?i)\bUPDATE\s+\S+\s+SET\b", true),
        rule("TRUNCATE", r"(?i)\bTRUNCATE\s+(TABLE\s+)?\S+", false),
        rule(
            "ALTER",
            r"(?i)\bALTER\s+(TABLE|VIEW|SCHEMA|DATABASE|INDEX|FUNCTION|PROCEDURE|USER|ROLE|SESSION|SYSTEM|WAREHOUSE)\b",
            false,
        ),
        rule(
            "CREATE",
            r"(?i)\bCREATE\s+(OR\s+REPLACE\s+)?(TEMP(ORARY)?\s+)?(TABLE|VIEW|SCHEMA|DATABASE|INDEX|FUNCTION|PROCEDURE|USER|ROLE|TRIGGER|STAGE)\b",
            false,
        ),
        rule("EXEC", r"(?i)\bEXEC(UTE)?\b\s*(\(|\w)", false),
        rule(
            "GRANT",
            r"(?i)\bGRANT\s+(ALL|SELECT|INSERT|UPDATE|DELETE|USAGE|EXECUTE|CREATE|ALTER|DROP|OWNERSHIP|ROLE)\b",
            false,
        ),
        rule(
            "REVOKE",
            r"(?i)\bREVOKE\s+(ALL|SELECT|INSERT|UPDATE|DELETE|USAGE|EXECUTE|CREATE|ALTER|DROP|OWNERSHIP|ROLE)\b",
            false,
        ),
    ]
});

static WHERE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bWHERE\b").unwrap_or_else(|e| panic!("invalid firewall pattern: {e}"))
});

/// First blocked keyword found in `text`, if any.
#[must_use]
pub fn blocked_keyword(text: &str) -> Option<&'static str> {
    RULES.iter().find_map(|rule| {
        let found = rule.pattern.find(text)?;
        if rule.scoped_by_where && WHERE_CLAUSE.is_match(&text[found.end()..]) {
            return None;
        }
        Some(rule.keyword)
    })
}

/// Screen every string in `value`, including array elements.
pub fn check_value(parameter: &str, value: &ParamValue) -> Result<(), BindError> {
    let mut blocked = None;
    value.for_each_text(&mut |text| {
        if blocked.is_none() {
            blocked = blocked_keyword(text);
        }
    });
    match blocked {
        Some(keyword) => Err(BindError::UnsafeValue {
            parameter: parameter.to_string(),
            keyword: keyword.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_shapes_blocked() {
        let cases = [
            ("x'; DROP TABLE users; --", "DROP"),
            ("drop   view v", "DROP"),
            ("1; DELETE FROM orders", "DELETE"),
            ("update accounts set balance = 0", "UPDATE"),
            ("TRUNCATE TABLE events", "TRUNCATE"),
            ("ALTER TABLE t ADD COLUMN c INT", "ALTER"),
            ("create or replace table t as select 1", "CREATE"),
            ("EXEC xp_cmdshell 'dir'", "EXEC"),
            ("execute(sp_who)", "EXEC"),
            ("GRANT ALL ON db TO public", "GRANT"),
            ("revoke select on t from bob", "REVOKE"),
        ];
        for (text, keyword) in cases {
            assert_eq!(blocked_keyword(text), Some(keyword), "{text}");
        }
    }

    #[test]
    fn test_scoped_statements_allowed() {
        assert_eq!(blocked_keyword("DELETE FROM t WHERE id = 1"), None);
        assert_eq!(blocked_keyword("UPDATE t SET a = 1 WHERE id = 2"), None);
    }

    #[test]
    fn test_ordinary_words_pass() {
        for text in [
            "Drop Cloth",
            "Created At",
            "executive summary",
            "granted",
            "update",
            "B00DROPXYZ",
            "O'Brien",
        ] {
            assert_eq!(blocked_keyword(text), None, "{text}");
        }
    }

    #[test]
    fn test_check_value_scans_array_elements() {
        let value = ParamValue::from(vec!["B001", "B002'); DROP TABLE t; --"]);
        let err = check_value("asins", &value).unwrap_err();
        assert_eq!(
            err,
            BindError::UnsafeValue {
                parameter: "asins".to_string(),
                keyword: "DROP".to_string(),
            }
        );

        assert!(check_value("n", &ParamValue::from(5_i64)).is_ok());
        assert!(check_value("s", &ParamValue::from("hello")).is_ok());
    }
}
