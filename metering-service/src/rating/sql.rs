//! Read-only checks for organization-supplied custom metric queries.

use crate::error::MeteringError;
use once_cell::sync::Lazy;
use regex::Regex;

static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid regex"));
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").expect("valid regex"));
static FORBIDDEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(alter|create|drop|delete|insert|replace|truncate|update)\b")
        .expect("valid regex")
});

/// Strip comments and a single trailing semicolon.
pub fn normalize(sql: &str) -> String {
    let without_blocks = BLOCK_COMMENT.replace_all(sql, " ");
    let without_lines = LINE_COMMENT.replace_all(&without_blocks, " ");
    let trimmed = without_lines.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim().to_string()
}

/// Accept a single `SELECT` (or `WITH ... SELECT`) statement and nothing else.
pub fn validate_custom_sql(sql: &str) -> Result<String, MeteringError> {
    let statement = normalize(sql);
    if statement.is_empty() {
        return Err(MeteringError::Configuration("custom query is empty".to_string()));
    }
    if statement.contains(';') {
        return Err(MeteringError::Configuration(
            "custom query must be a single statement".to_string(),
        ));
    }
    let first = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first != "SELECT" && first != "WITH" {
        return Err(MeteringError::Configuration(format!(
            "custom query must be a SELECT, found {first}"
        )));
    }
    if let Some(found) = FORBIDDEN.find(&statement) {
        return Err(MeteringError::Configuration(format!(
            "custom query contains forbidden keyword {}",
            found.as_str().to_ascii_uppercase()
        )));
    }
    Ok(statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_select_passes() {
        let sql = "SELECT customer_id, SUM((properties->>'gb')::numeric) AS usage_qty FROM events GROUP BY customer_id;";
        assert!(validate_custom_sql(sql).is_ok());
    }

    #[test]
    fn cte_passes() {
        assert!(validate_custom_sql("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
    }

    #[test]
    fn mutations_are_rejected() {
        for sql in [
            "DELETE FROM events",
            "SELECT 1; DROP TABLE events",
            "select * from events where name = 'a' union select 1 from (update events set x = 1) t",
            "WITH gone AS (DELETE FROM events RETURNING *) SELECT * FROM gone",
        ] {
            let err = validate_custom_sql(sql).unwrap_err();
            assert!(matches!(err, MeteringError::Configuration(_)), "{sql}");
        }
    }

    #[test]
    fn comments_cannot_hide_a_second_statement() {
        assert!(validate_custom_sql("SELECT 1 /* ; */ -- ;").is_ok());
        assert!(validate_custom_sql("SELECT 1; -- trailing\nSELECT 2").is_err());
    }

    #[test]
    fn keyword_inside_identifier_is_allowed() {
        assert!(validate_custom_sql("SELECT last_updated_at FROM events").is_ok());
    }
}
