use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::AppError;

/// Checks that rendered TQL is a single read-only statement
pub struct TqlValidator;

impl TqlValidator {
    fn parse(tql: &str) -> Result<Vec<Statement>, AppError> {
        let dialect = GenericDialect {};
        Parser::parse_sql(&dialect, tql)
            .map_err(|e| AppError::InvalidQuery(format!("TQL parsing error: {}", e)))
    }

    /// Validate TQL and ensure it's exactly one SELECT statement
    pub fn validate_select_only(tql: &str) -> Result<String, AppError> {
        let ast = Self::parse(tql)?;

        match ast.as_slice() {
            [] => Err(AppError::InvalidQuery("Empty TQL query".to_string())),
            [Statement::Query(_)] => Ok(tql.to_string()),
            [other] => {
                let rendered = other.to_string();
                let keyword = rendered.split_whitespace().next().unwrap_or("UNKNOWN");
                Err(AppError::InvalidQuery(format!(
                    "{} statements are not allowed. Only SELECT queries are permitted.",
                    keyword.to_uppercase()
                )))
            }
            many => Err(AppError::InvalidQuery(format!(
                "Expected a single statement, found {}",
                many.len()
            ))),
        }
    }

    /// Append a LIMIT clause when the query has none
    pub fn ensure_limit(tql: &str, default_limit: u64) -> Result<String, AppError> {
        let ast = Self::parse(tql)?;
        let stmt = ast
            .first()
            .ok_or_else(|| AppError::InvalidQuery("Empty TQL query".to_string()))?;

        if Self::check_limit_in_statement(stmt) {
            Ok(tql.to_string())
        } else {
            let trimmed = tql.trim_end_matches(';').trim();
            Ok(format!("{} LIMIT {}", trimmed, default_limit))
        }
    }

    /// LIMIT detection on the AST, so names and comments containing "limit" don't count
    fn check_limit_in_statement(stmt: &Statement) -> bool {
        match stmt {
            Statement::Query(query) => query.limit_clause.is_some(),
            _ => false,
        }
    }

    /// Validate SELECT-only and cap the row count. Returns whether a limit was added.
    pub fn validate_and_prepare(tql: &str, default_limit: u64) -> Result<(String, bool), AppError> {
        let validated = Self::validate_select_only(tql)?;
        let original_has_limit = Self::has_limit(&validated);
        let prepared = Self::ensure_limit(&validated, default_limit)?;
        Ok((prepared, !original_has_limit))
    }

    fn has_limit(tql: &str) -> bool {
        Self::parse(tql)
            .ok()
            .and_then(|ast| ast.first().map(Self::check_limit_in_statement))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_select_only() {
        assert!(TqlValidator::validate_select_only("SELECT * FROM users").is_ok());
        assert!(TqlValidator::validate_select_only(
            "SELECT status, COUNT(*) AS count_all FROM orders GROUP BY status"
        )
        .is_ok());

        let err = TqlValidator::validate_select_only("DELETE FROM users").unwrap_err();
        assert!(matches!(err, AppError::InvalidQuery(_)));
        assert!(err.to_string().contains("DELETE"));
        assert!(TqlValidator::validate_select_only("UPDATE users SET name = 'x'").is_err());
        assert!(TqlValidator::validate_select_only("SELECT 1; SELECT 2").is_err());
        assert!(TqlValidator::validate_select_only("SELEC * FROM").is_err());
        assert!(TqlValidator::validate_select_only("").is_err());
    }

    #[test]
    fn test_validate_and_prepare() {
        let (tql, applied) = TqlValidator::validate_and_prepare("SELECT * FROM users", 1000).unwrap();
        assert_eq!(tql, "SELECT * FROM users LIMIT 1000");
        assert!(applied);

        let (tql, applied) =
            TqlValidator::validate_and_prepare("SELECT * FROM users LIMIT 50 OFFSET 5", 1000).unwrap();
        assert!(tql.contains("LIMIT 50"));
        assert!(!applied);

        assert!(TqlValidator::validate_and_prepare("DROP TABLE users", 1000).is_err());
    }

    #[test]
    fn test_limit_detection_ignores_names_and_comments() {
        assert!(!TqlValidator::has_limit("SELECT * FROM table_limit"));
        assert!(!TqlValidator::has_limit("SELECT limit_value FROM users"));
        assert!(!TqlValidator::has_limit("SELECT * FROM users /* LIMIT */"));
        assert!(TqlValidator::has_limit("SELECT * FROM users LIMIT 10"));
    }
}
