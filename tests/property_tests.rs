//! Property-based tests for the connection string vault and command timeouts
//!
//! These tests verify that:
//! - Any connection string survives the vault unchanged
//! - Re-storing the same string never yields the same ciphertext
//! - Valid timeouts are recorded on the command exactly as given
//! - Invalid timeouts are rejected before anything runs

#[cfg(test)]
mod tests {
    use dbdata::{Command, ConnectionStringVault, DataAccessObject, DbDataError, QueryOptions};
    use proptest::prelude::*;
    use rusqlite::Connection;
    use tempfile::NamedTempFile;

    // Test infrastructure

    /// Creates a temporary SQLite database holding `t(x)` with three rows
    fn create_temp_db() -> NamedTempFile {
        let temp_file = NamedTempFile::new().unwrap();
        Connection::open(temp_file.path())
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t (x) VALUES (1), (2), (3);")
            .unwrap();
        temp_file
    }

    fn connection_string(file: &NamedTempFile) -> String {
        format!("Data Source={}", file.path().display())
    }

    fn row_count(file: &NamedTempFile) -> i64 {
        Connection::open(file.path())
            .unwrap()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap()
    }

    proptest! {
        #[test]
        fn prop_vault_round_trip(value in "\\PC{0,200}") {
            let vault = ConnectionStringVault::with_connection_string(&value).unwrap();
            prop_assert_eq!(vault.get().unwrap(), value.clone());
            prop_assert_eq!(vault.is_empty(), value.is_empty());
        }

        #[test]
        fn prop_vault_ciphertext_changes_on_every_set(value in "[ -~]{1,120}") {
            let mut vault = ConnectionStringVault::new();
            vault.set(&value).unwrap();
            let first = vault.ciphertext().unwrap().to_vec();
            vault.set(&value).unwrap();

            prop_assert_ne!(first.as_slice(), vault.ciphertext().unwrap());
            prop_assert_eq!(vault.get().unwrap(), value);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_valid_timeout_recorded_on_command(timeout in 0i32..=3600) {
            let db = create_temp_db();
            let dao = DataAccessObject::new(&connection_string(&db)).unwrap();

            let mut command = Command::new("UPDATE t SET x = x");
            let affected = dao
                .execute_command(&mut command, QueryOptions::new().with_timeout(timeout))
                .unwrap();

            prop_assert_eq!(affected, 3);
            prop_assert_eq!(command.timeout(), Some(timeout as u32));
        }

        #[test]
        fn prop_invalid_timeout_rejected(timeout in i32::MIN..-1) {
            let db = create_temp_db();
            let dao = DataAccessObject::new(&connection_string(&db)).unwrap();

            let result = dao.execute("DELETE FROM t", QueryOptions::new().with_timeout(timeout));
            prop_assert!(matches!(result, Err(DbDataError::InvalidTimeout(t)) if t == timeout));
            prop_assert!(!dao.is_connection_open());
            prop_assert_eq!(row_count(&db), 3);
        }
    }
}
