//! Read-only SQL gate.
//!
//! A deny-list, not a parser: it bounds what a hallucinated statement can do but does not
//! prove a query harmless across every dialect quirk. Every generated or repaired query
//! passes through [`SqlValidator::check`] before it can be executed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Rejection reason, empty when allowed.
    pub fn reason(&self) -> &str {
        match self {
            PolicyDecision::Allow => "",
            PolicyDecision::Deny(r) => r,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Select,
    Show,
    Describe,
    Explain,
    Unsafe,
}

pub const ALLOWED_STATEMENTS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "WITH"];

pub const FORBIDDEN_STATEMENTS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "REPLACE", "RENAME",
    "GRANT", "REVOKE", "CALL", "EXECUTE", "LOAD", "LOCK", "UNLOCK", "SET", "START", "COMMIT",
    "ROLLBACK", "SAVEPOINT", "USE",
];

struct DangerousPattern {
    label: &'static str,
    regex: Regex,
}

fn pattern(label: &'static str, re: &str) -> DangerousPattern {
    DangerousPattern {
        label,
        regex: Regex::new(re).expect("static deny-list pattern"),
    }
}

static DANGEROUS_PATTERNS: Lazy<Vec<DangerousPattern>> = Lazy::new(|| {
    vec![
        pattern(
            "stacked statement",
            r"(?is);\s*(INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|TRUNCATE)",
        ),
        pattern("INTO OUTFILE", r"(?is)INTO\s+OUTFILE"),
        pattern("INTO DUMPFILE", r"(?is)INTO\s+DUMPFILE"),
        pattern("LOAD_FILE", r"(?is)LOAD_FILE"),
        pattern("trailing comment", r"(?s)--\s*$"),
        pattern("block comment", r"(?s)/\*.*?\*/"),
    ]
});

static SELECT_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSELECT\b").expect("static pattern"));

static FORBIDDEN_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\b({})\b", FORBIDDEN_STATEMENTS.join("|"))).expect("static pattern")
});

/// SQL that passed [`SqlValidator::check`].
///
/// The only way to build one is through the validator, so anything holding a
/// `ValidatedSql` has been through the policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedSql {
    sql: String,
    kind: QueryKind,
}

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn into_string(self) -> String {
        self.sql
    }
}

impl std::fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SqlValidator;

impl SqlValidator {
    pub fn new() -> Self {
        Self
    }

    /// Classify `query`. Never panics, never errors.
    pub fn validate(&self, query: &str) -> PolicyDecision {
        if query.trim().is_empty() {
            return PolicyDecision::Deny("Empty query provided".into());
        }

        for p in DANGEROUS_PATTERNS.iter() {
            if p.regex.is_match(query) {
                return PolicyDecision::Deny(format!(
                    "Query contains forbidden pattern: {}",
                    p.label
                ));
            }
        }

        let normalized = normalize(query);
        let first_word = normalized.split(' ').next().unwrap_or_default();

        if FORBIDDEN_STATEMENTS.contains(&first_word) {
            return PolicyDecision::Deny(format!(
                "Query type '{first_word}' is not allowed. Only SELECT and discovery queries are permitted."
            ));
        }
        if !ALLOWED_STATEMENTS.contains(&first_word) {
            return PolicyDecision::Deny(format!(
                "Unknown or unsupported query type '{first_word}'. Only SELECT and discovery queries are permitted."
            ));
        }

        // A CTE can carry a write after its first token.
        if first_word == "WITH" {
            if !SELECT_WORD.is_match(&normalized) {
                return PolicyDecision::Deny(
                    "WITH clause must be followed by a SELECT statement".into(),
                );
            }
            if let Some(m) = FORBIDDEN_WORD.find(&normalized) {
                return PolicyDecision::Deny(format!(
                    "WITH clause contains forbidden statement: {}",
                    m.as_str()
                ));
            }
        }

        let body = query.trim_end();
        let body = body.strip_suffix(';').unwrap_or(body);
        if body.contains(';') {
            return PolicyDecision::Deny("Multiple statements are not allowed".into());
        }

        PolicyDecision::Allow
    }

    pub fn validate_and_raise(&self, query: &str) -> Result<(), ValidationError> {
        match self.validate(query) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => Err(ValidationError(reason)),
        }
    }

    /// Validate and wrap `query` for execution.
    pub fn check(&self, query: &str) -> Result<ValidatedSql, ValidationError> {
        self.validate_and_raise(query)?;
        Ok(ValidatedSql {
            sql: query.to_string(),
            kind: self.query_kind(query),
        })
    }

    pub fn is_read_only(&self, query: &str) -> bool {
        self.validate(query).is_allowed()
    }

    /// Coarse classification by first keyword only.
    pub fn query_kind(&self, query: &str) -> QueryKind {
        let normalized = normalize(query);
        match normalized.split(' ').next().unwrap_or_default() {
            "SELECT" | "WITH" => QueryKind::Select,
            "SHOW" => QueryKind::Show,
            "DESCRIBE" | "DESC" => QueryKind::Describe,
            "EXPLAIN" => QueryKind::Explain,
            _ => QueryKind::Unsafe,
        }
    }
}

fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(sql: &str) -> bool {
        SqlValidator::new().validate(sql).is_allowed()
    }

    #[test]
    fn write_statements_rejected() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DELETE FROM t",
            "  drop table t;",
            "CREATE TABLE t (a int)",
            "ALTER TABLE t ADD b int",
            "TRUNCATE t",
        ] {
            assert!(!ok(sql), "{sql} should be rejected");
        }
    }

    #[test]
    fn read_statements_accepted() {
        for sql in [
            "SELECT * FROM orders;",
            "select id,\n  name from customers where id = 3",
            "SHOW TABLES;",
            "DESCRIBE orders;",
            "DESC orders",
            "EXPLAIN SELECT * FROM orders;",
        ] {
            assert!(ok(sql), "{sql} should be accepted");
        }
    }

    #[test]
    fn cte_bodies_are_scanned() {
        assert!(ok("WITH x AS (SELECT 1) SELECT * FROM x;"));
        let decision = SqlValidator::new().validate("WITH x AS (SELECT 1) DELETE FROM x;");
        assert_eq!(
            decision,
            PolicyDecision::Deny("WITH clause contains forbidden statement: DELETE".into())
        );
        assert!(!ok("WITH x AS (VALUES 1) TABLE x"));
    }

    #[test]
    fn stacked_and_exfiltration_rejected() {
        let decision = SqlValidator::new().validate("SELECT 1; DROP TABLE t;");
        assert_eq!(
            decision.reason(),
            "Query contains forbidden pattern: stacked statement"
        );
        assert!(!ok("SELECT * FROM t INTO OUTFILE '/tmp/x'"));
        assert!(!ok("SELECT LOAD_FILE('/etc/passwd')"));
        assert!(!ok("SELECT 1 /* hi */"));
        assert!(!ok("SELECT 1 --"));
        assert!(!ok("SELECT 1; SELECT 2;"));
    }

    #[test]
    fn trailing_semicolon_tolerated_once() {
        assert!(ok("SELECT 1;"));
        assert!(ok("SELECT 1;  \n"));
        assert!(!ok("SELECT 1;;"));
    }

    #[test]
    fn empty_and_unknown_rejected() {
        assert_eq!(
            SqlValidator::new().validate("   ").reason(),
            "Empty query provided"
        );
        assert!(!ok("VACUUM"));
        assert!(!ok(";"));
    }

    #[test]
    fn check_wraps_kind() {
        let v = SqlValidator::new();
        let sql = v.check("show tables").unwrap();
        assert_eq!(sql.kind(), QueryKind::Show);
        assert_eq!(sql.as_str(), "show tables");
        assert!(v.check("DROP TABLE t").is_err());
        assert_eq!(v.query_kind("GRANT ALL"), QueryKind::Unsafe);
    }
}
