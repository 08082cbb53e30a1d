/// # Test Utilities Module
///
/// File-backed database fixtures for tests. Every fixture lives in its own
/// temporary directory, so tests can open as many connections to it as they
/// need and run in parallel without sharing state.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Isolated database test fixture
pub struct DatabaseFixture {
    _dir: TempDir,
    path: PathBuf,
}

impl DatabaseFixture {
    /// Create an empty database file
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create fixture directory");
        let path = dir.path().join("fixture.db");
        Connection::open(&path).expect("Failed to create fixture database");
        DatabaseFixture { _dir: dir, path }
    }

    /// Create fixture with the standard sample schema:
    ///
    /// - `t(x)` holding 1, 2, 3
    /// - `numbers(n)` holding 1..=1000
    /// - `users` and `posts` with a foreign key between them
    pub fn with_sample_data() -> Self {
        let fixture = Self::new();
        fixture
            .connection()
            .execute_batch(
                "
                CREATE TABLE t (x INTEGER);
                INSERT INTO t (x) VALUES (1), (2), (3);

                CREATE TABLE numbers (n INTEGER PRIMARY KEY);
                WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 1000)
                INSERT INTO numbers (n) SELECT n FROM seq;

                CREATE TABLE users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL
                );
                CREATE TABLE posts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
                );
                INSERT INTO users (username, email) VALUES
                    ('alice', 'alice@example.com'),
                    ('bob', 'bob@example.com');
                INSERT INTO posts (user_id, title) VALUES
                    (1, 'Welcome to Rust'),
                    (2, 'My Trip to Paris');
                ",
            )
            .expect("Failed to create sample schema");
        fixture
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection string pointing at the fixture database
    pub fn connection_string(&self) -> String {
        format!("Data Source={}", self.path.display())
    }

    /// A fresh connection, independent of anything under test
    pub fn connection(&self) -> Connection {
        Connection::open(&self.path).expect("Failed to open fixture database")
    }

    /// Row count of `table`, read through a fresh connection
    pub fn count(&self, table: &str) -> i64 {
        self.connection()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("Failed to count rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_data_fixture() {
        let fixture = DatabaseFixture::with_sample_data();
        assert!(fixture.path().exists());
        assert_eq!(fixture.count("t"), 3);
        assert_eq!(fixture.count("numbers"), 1000);
        assert_eq!(fixture.count("users"), 2);
        assert!(fixture.connection_string().starts_with("Data Source="));
    }

    #[test]
    fn test_fixtures_are_isolated() {
        let first = DatabaseFixture::with_sample_data();
        let second = DatabaseFixture::with_sample_data();
        first.connection().execute("DELETE FROM t", []).unwrap();
        assert_eq!(first.count("t"), 0);
        assert_eq!(second.count("t"), 3);
    }
}
