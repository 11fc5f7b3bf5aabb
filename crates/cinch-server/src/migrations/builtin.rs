//! Built-in Cinch schema migrations.
//!
//! These create the internal tables and are applied once, tracked in
//! cinch_migrations.

use super::runner::Migration;

const CINCH_INTERNAL_SQL: &str = include_str!("../../migrations/0000_cinch_internal.sql");

/// Get all built-in migrations, in application order.
pub fn get_builtin_migrations() -> Vec<Migration> {
    vec![Migration::new("0000_cinch_internal", CINCH_INTERNAL_SQL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_builtin_migrations() {
        let migrations = get_builtin_migrations();
        assert!(!migrations.is_empty());
        assert_eq!(migrations[0].name, "0000_cinch_internal");
    }

    #[test]
    fn test_migration_sql_contains_tables() {
        let sql = &get_builtin_migrations()[0].sql;

        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_users"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_tokens"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_repos"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_secrets"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_workers"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_jobs"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_log_chunks"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS cinch_log_index"));
    }

    #[test]
    fn test_job_natural_key_is_unique() {
        let sql = &get_builtin_migrations()[0].sql;
        assert!(sql.contains("UNIQUE (repo_id, commit_sha, attempt)"));
    }
}
