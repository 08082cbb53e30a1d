/// Query Execution Module
///
/// This module provides the building blocks the data access object executes:
/// values, commands, command timeouts, execution options and the in-memory
/// tabular results (`DataTable`, `DataSet`). The execution primitives at the
/// bottom run on an already opened connection and never open or close one.

use crate::core::{DbDataError, DriverError, Result};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Batch, Connection, Row, Statement, ToSql};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Timeout sentinel meaning "use the driver default"
pub const DEFAULT_TIMEOUT: i32 = -1;

/// Name given to the first result table of a batch
pub const DEFAULT_TABLE_NAME: &str = "Table";

/// Number of SQLite virtual machine steps between two deadline checks
const PROGRESS_INTERVAL_OPS: i32 = 1000;

/// A single database value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Returns true for SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer content, if this is an integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text content, if this is text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(*i),
            Value::Real(f) => ValueRef::Real(*f),
            Value::Text(s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(b) => ValueRef::Blob(b),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(t) => f.write_str(t),
            Value::Blob(b) => write!(f, "<BLOB: {} bytes>", b.len()),
        }
    }
}

/// Validated command timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandTimeout {
    /// Use the connection's default timeout
    #[default]
    DriverDefault,
    /// Abort the command after this many seconds; zero means no limit
    Seconds(u32),
}

impl CommandTimeout {
    /// Resolves the timeout actually enforced, given the connection default.
    pub(crate) fn effective(self, default: Option<u32>) -> Option<u32> {
        match self {
            CommandTimeout::DriverDefault => default.filter(|seconds| *seconds > 0),
            CommandTimeout::Seconds(0) => None,
            CommandTimeout::Seconds(seconds) => Some(seconds),
        }
    }
}

impl TryFrom<i32> for CommandTimeout {
    type Error = DbDataError;

    /// `-1` selects the driver default, any non-negative value is taken as
    /// seconds, everything else is rejected.
    fn try_from(value: i32) -> Result<Self> {
        match value {
            DEFAULT_TIMEOUT => Ok(CommandTimeout::DriverDefault),
            _ => u32::try_from(value)
                .map(CommandTimeout::Seconds)
                .map_err(|_| DbDataError::InvalidTimeout(value)),
        }
    }
}

/// A prebuilt command: SQL text, positional parameters and an optional timeout
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    params: Vec<Value>,
    timeout: Option<u32>,
}

impl Command {
    /// Creates a command without parameters that uses the driver default timeout
    pub fn new(text: impl Into<String>) -> Self {
        Command {
            text: text.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    /// Appends a positional parameter (bound as `?1`, `?2`, ...)
    pub fn with_param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Presets the command timeout in seconds
    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Timeout set on this command; `None` means the driver default
    pub fn timeout(&self) -> Option<u32> {
        self.timeout
    }

    /// Records an explicit timeout on the command; the default sentinel keeps
    /// whatever the command already carries.
    pub(crate) fn apply(&mut self, timeout: CommandTimeout) {
        if let CommandTimeout::Seconds(seconds) = timeout {
            self.timeout = Some(seconds);
        }
    }

    pub(crate) fn effective_timeout(&self) -> CommandTimeout {
        self.timeout
            .map_or(CommandTimeout::DriverDefault, CommandTimeout::Seconds)
    }
}

/// Where a call runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Open the primary connection for the duration of the call
    #[default]
    Direct,
    /// Run on the active transaction's connection
    Transactional,
}

/// Per-call options: raw timeout (validated at call time) and execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub timeout: i32,
    pub mode: ExecutionMode,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            timeout: DEFAULT_TIMEOUT,
            mode: ExecutionMode::Direct,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options routed to the active transaction
    pub fn transactional() -> Self {
        Self::default().in_transaction()
    }

    pub fn with_timeout(mut self, timeout: i32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_transaction(mut self) -> Self {
        self.mode = ExecutionMode::Transactional;
        self
    }
}

/// In-memory snapshot of one result set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTable {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        DataTable {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, matched case-insensitively
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
    }

    /// Value at `row` in the named column
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row)?.get(index)
    }
}

/// Collection of result tables produced by one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataSet {
    pub tables: Vec<DataTable>,
}

impl DataSet {
    /// Table by name, matched case-insensitively
    pub fn table(&self, name: &str) -> Option<&DataTable> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    /// Serializes the whole snapshot as pretty-printed JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Command timeout enforcement for the lifetime of the value.
///
/// Installs a progress handler that interrupts the running statement once the
/// deadline passes and removes it again on drop.
pub(crate) struct Deadline<'c> {
    connection: &'c Connection,
    seconds: Option<u32>,
    installed: Instant,
    // Milliseconds after `installed`, shared with the progress handler
    expires_ms: Arc<AtomicU64>,
}

impl<'c> Deadline<'c> {
    pub(crate) fn install(connection: &'c Connection, seconds: Option<u32>) -> Self {
        let deadline = Deadline {
            connection,
            seconds,
            installed: Instant::now(),
            expires_ms: Arc::new(AtomicU64::new(u64::MAX)),
        };
        if seconds.is_some() {
            deadline.restart();
            let installed = deadline.installed;
            let expires_ms = Arc::clone(&deadline.expires_ms);
            connection.progress_handler(
                PROGRESS_INTERVAL_OPS,
                Some(move || millis_since(installed) >= expires_ms.load(Ordering::Relaxed)),
            );
        }
        deadline
    }

    /// Gives the next step the full timeout again, counted from now
    pub(crate) fn restart(&self) {
        if let Some(seconds) = self.seconds {
            let expires = millis_since(self.installed).saturating_add(u64::from(seconds) * 1000);
            self.expires_ms.store(expires, Ordering::Relaxed);
        }
    }

    /// Reports interrupts caused by this deadline as timeouts
    pub(crate) fn classify(&self, err: DriverError) -> DriverError {
        match self.seconds {
            Some(seconds) if err.is_interrupt() => DriverError::Timeout(seconds),
            _ => err,
        }
    }
}

impl Drop for Deadline<'_> {
    fn drop(&mut self) {
        if self.seconds.is_some() {
            self.connection.progress_handler(0, None::<fn() -> bool>);
        }
    }
}

fn millis_since(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Runs every statement of a batch and returns the total number of rows
/// affected by the statements that produce no result columns.
///
/// Statements that produce rows are stepped to completion and add nothing.
pub(crate) fn execute_non_query(conn: &Connection, command: &Command) -> std::result::Result<usize, DriverError> {
    let mut affected = 0;
    let mut batch = Batch::new(conn, command.text());

    while let Some(mut stmt) = batch.next()? {
        let bound = params_from_iter(command.params().iter().take(stmt.parameter_count()));
        if stmt.column_count() == 0 {
            affected += stmt.execute(bound)?;
        } else {
            let mut rows = stmt.query(bound)?;
            while rows.next()?.is_some() {}
        }
    }

    Ok(affected)
}

/// Runs every statement of a batch and returns the first column of the first
/// row of the first statement that produces columns, or NULL.
pub(crate) fn execute_scalar(conn: &Connection, command: &Command) -> std::result::Result<Value, DriverError> {
    let mut scalar = None;
    let mut batch = Batch::new(conn, command.text());

    while let Some(mut stmt) = batch.next()? {
        let bound = params_from_iter(command.params().iter().take(stmt.parameter_count()));
        if stmt.column_count() == 0 {
            stmt.execute(bound)?;
            continue;
        }

        let mut rows = stmt.query(bound)?;
        let first = match rows.next()? {
            Some(row) => Value::from(row.get_ref(0)?),
            None => Value::Null,
        };
        scalar.get_or_insert(first);
    }

    Ok(scalar.unwrap_or(Value::Null))
}

/// Runs every statement of a batch, collecting one table per result set.
///
/// Statements without result columns are executed and skipped. Parameters are
/// bound positionally to each statement, as many as it declares.
pub(crate) fn fill_data_set(
    conn: &Connection,
    command: &Command,
    table_names: &[&str],
) -> std::result::Result<DataSet, DriverError> {
    let mut data_set = DataSet::default();
    let mut batch = Batch::new(conn, command.text());

    while let Some(mut stmt) = batch.next()? {
        let bound = command.params().iter().take(stmt.parameter_count());
        if stmt.column_count() == 0 {
            stmt.execute(params_from_iter(bound))?;
            continue;
        }
        let name = result_table_name(data_set.tables.len(), table_names);
        let table = read_table(&mut stmt, name, bound)?;
        data_set.tables.push(table);
    }

    Ok(data_set)
}

/// First result table of a batch, or an empty one if the batch returned none
pub(crate) fn fill_data_table(conn: &Connection, command: &Command) -> std::result::Result<DataTable, DriverError> {
    let data_set = fill_data_set(conn, command, &[])?;
    Ok(data_set
        .tables
        .into_iter()
        .next()
        .unwrap_or_else(|| DataTable::new(DEFAULT_TABLE_NAME, Vec::new())))
}

fn result_table_name(index: usize, table_names: &[&str]) -> String {
    match table_names.get(index) {
        Some(name) => name.to_string(),
        None if index == 0 => DEFAULT_TABLE_NAME.to_string(),
        None => format!("{DEFAULT_TABLE_NAME}{index}"),
    }
}

fn read_table<'p>(
    stmt: &mut Statement<'_>,
    name: String,
    params: impl Iterator<Item = &'p Value>,
) -> std::result::Result<DataTable, DriverError> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();
    let mut table = DataTable::new(name, columns);

    let mut rows = stmt.query(params_from_iter(params))?;
    while let Some(row) = rows.next()? {
        table.rows.push(read_row(row, column_count)?);
    }

    Ok(table)
}

/// Copies one row into owned values
pub(crate) fn read_row(row: &Row<'_>, column_count: usize) -> rusqlite::Result<Vec<Value>> {
    (0..column_count)
        .map(|index| row.get_ref(index).map(Value::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup_test_table(conn: &Connection) {
        conn.execute_batch(
            "
            CREATE TABLE test (
                id INTEGER PRIMARY KEY,
                name TEXT,
                value REAL,
                data BLOB
            );
            INSERT INTO test (name, value, data) VALUES ('Alice', 123.45, X'48656C6C6F');
            INSERT INTO test (name, value) VALUES ('Bob', 678.90);
            INSERT INTO test (name, value) VALUES (NULL, NULL);
        ",
        )
        .unwrap();
    }

    #[test]
    fn test_timeout_validation() {
        assert_eq!(CommandTimeout::try_from(-1).unwrap(), CommandTimeout::DriverDefault);
        assert_eq!(CommandTimeout::try_from(0).unwrap(), CommandTimeout::Seconds(0));
        assert_eq!(CommandTimeout::try_from(45).unwrap(), CommandTimeout::Seconds(45));
        assert!(matches!(
            CommandTimeout::try_from(-2),
            Err(DbDataError::InvalidTimeout(-2))
        ));
        assert!(matches!(
            CommandTimeout::try_from(i32::MIN),
            Err(DbDataError::InvalidTimeout(i32::MIN))
        ));
    }

    #[test]
    fn test_effective_timeout() {
        assert_eq!(CommandTimeout::DriverDefault.effective(None), None);
        assert_eq!(CommandTimeout::DriverDefault.effective(Some(30)), Some(30));
        assert_eq!(CommandTimeout::DriverDefault.effective(Some(0)), None);
        assert_eq!(CommandTimeout::Seconds(0).effective(Some(30)), None);
        assert_eq!(CommandTimeout::Seconds(5).effective(Some(30)), Some(5));
    }

    #[test]
    fn test_command_timeout_recording() {
        let mut command = Command::new("SELECT 1").with_timeout(9);
        command.apply(CommandTimeout::DriverDefault);
        assert_eq!(command.timeout(), Some(9));
        command.apply(CommandTimeout::Seconds(2));
        assert_eq!(command.timeout(), Some(2));
        assert_eq!(command.effective_timeout(), CommandTimeout::Seconds(2));
        assert_eq!(
            Command::new("SELECT 1").effective_timeout(),
            CommandTimeout::DriverDefault
        );
    }

    #[test]
    fn test_execute_non_query_with_params() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let command = Command::new("UPDATE test SET value = ?1 WHERE name = ?2")
            .with_param(1.5)
            .with_param("Bob");
        assert_eq!(execute_non_query(&conn, &command).unwrap(), 1);

        let all = Command::new("UPDATE test SET value = 0");
        assert_eq!(execute_non_query(&conn, &all).unwrap(), 3);
    }

    #[test]
    fn test_execute_scalar() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let count = execute_scalar(&conn, &Command::new("SELECT COUNT(*) FROM test")).unwrap();
        assert_eq!(count, Value::Integer(3));

        let none = execute_scalar(&conn, &Command::new("SELECT name FROM test WHERE id = 99")).unwrap();
        assert!(none.is_null());

        let insert = Command::new("INSERT INTO test (name) VALUES (?1)").with_param("Carol");
        assert!(execute_scalar(&conn, &insert).unwrap().is_null());
        let count = execute_scalar(&conn, &Command::new("SELECT COUNT(*) FROM test")).unwrap();
        assert_eq!(count.as_i64(), Some(4));
    }

    #[test]
    fn test_non_query_runs_whole_batch() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let batch = Command::new(
            "UPDATE test SET value = 1; SELECT * FROM test; DELETE FROM test WHERE name IS NULL",
        );
        assert_eq!(execute_non_query(&conn, &batch).unwrap(), 4);
        let count = execute_scalar(&conn, &Command::new("SELECT COUNT(*) FROM test")).unwrap();
        assert_eq!(count, Value::Integer(2));
    }

    #[test]
    fn test_scalar_runs_whole_batch() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let batch = Command::new(
            "DELETE FROM test WHERE id = 1; SELECT 5; SELECT 6; DELETE FROM test WHERE id = 2",
        );
        assert_eq!(execute_scalar(&conn, &batch).unwrap(), Value::Integer(5));
        let count = execute_scalar(&conn, &Command::new("SELECT COUNT(*) FROM test")).unwrap();
        assert_eq!(count, Value::Integer(1));

        let empty_first = Command::new("SELECT name FROM test WHERE id = 99; SELECT 7");
        assert!(execute_scalar(&conn, &empty_first).unwrap().is_null());
    }

    #[test]
    fn test_fill_data_set_names_tables() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let command = Command::new(
            "SELECT id, name FROM test ORDER BY id;
             UPDATE test SET value = 1;
             SELECT COUNT(*) AS total FROM test;
             SELECT 'x' AS marker",
        );
        let data_set = fill_data_set(&conn, &command, &["people"]).unwrap();

        let names: Vec<&str> = data_set.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["people", "Table1", "Table2"]);

        let people = data_set.table("PEOPLE").unwrap();
        assert_eq!(people.columns, vec!["id", "name"]);
        assert_eq!(people.row_count(), 3);
        assert_eq!(people.value(0, "name"), Some(&Value::Text("Alice".to_string())));
        assert_eq!(people.value(2, "name"), Some(&Value::Null));

        let total = data_set.table("Table1").unwrap();
        assert_eq!(total.value(0, "total"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_fill_data_table() {
        let conn = Connection::open_in_memory().unwrap();
        setup_test_table(&conn);

        let table = fill_data_table(&conn, &Command::new("SELECT * FROM test ORDER BY id")).unwrap();
        assert_eq!(table.name, DEFAULT_TABLE_NAME);
        assert_eq!(table.columns, vec!["id", "name", "value", "data"]);
        assert_eq!(table.rows[0][3].to_string(), "<BLOB: 5 bytes>");

        let empty = fill_data_table(&conn, &Command::new("DELETE FROM test WHERE id = 3")).unwrap();
        assert!(empty.columns.is_empty());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_query_error_handling() {
        let conn = Connection::open_in_memory().unwrap();
        let result = fill_data_table(&conn, &Command::new("SELECT * FROM nonexistent_table"));
        match result.unwrap_err() {
            DriverError::Sqlite(err) => assert!(err.to_string().contains("no such table")),
            other => panic!("Expected Sqlite error, got {other:?}"),
        }
    }

    #[test]
    fn test_deadline_interrupts_long_query() {
        let conn = Connection::open_in_memory().unwrap();
        let endless = Command::new(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT COUNT(*) FROM c",
        );

        let result = {
            let deadline = Deadline::install(&conn, Some(1));
            execute_scalar(&conn, &endless).map_err(|err| deadline.classify(err))
        };
        assert!(matches!(result, Err(DriverError::Timeout(1))));

        // The handler is gone once the deadline is dropped
        let value = execute_scalar(&conn, &Command::new("SELECT 42")).unwrap();
        assert_eq!(value, Value::Integer(42));
    }

    #[test]
    fn test_deadline_restart_grants_full_timeout() {
        let conn = Connection::open_in_memory().unwrap();
        let bounded = Command::new(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 100000) SELECT COUNT(*) FROM c",
        );

        let deadline = Deadline::install(&conn, Some(1));
        std::thread::sleep(std::time::Duration::from_millis(1200));
        deadline.restart();
        let value = execute_scalar(&conn, &bounded).map_err(|err| deadline.classify(err));
        assert_eq!(value.unwrap(), Value::Integer(100000));
    }

    #[test]
    fn test_data_set_json() {
        let mut table = DataTable::new("Table", vec!["id".to_string(), "name".to_string()]);
        table.rows.push(vec![Value::Integer(1), Value::Null]);
        let data_set = DataSet { tables: vec![table] };

        let json = data_set.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["tables"][0]["name"], "Table");
        assert_eq!(parsed["tables"][0]["rows"][0][0], 1);
        assert!(parsed["tables"][0]["rows"][0][1].is_null());
    }
}
