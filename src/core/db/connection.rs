/// Connection Management Module
///
/// This module parses connection strings, opens SQLite sessions and tracks
/// whether a connection handle is currently open. A `Session` closes its
/// connection when dropped, so a session held in a local binding is closed on
/// every exit path of the call that opened it.

use crate::core::db::query::{CommandTimeout, Deadline};
use crate::core::DriverError;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Represents the transaction facet of a data access object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No transaction; every call opens and closes the primary connection
    #[default]
    Idle,
    /// A transaction is open on the dedicated transaction connection
    Active,
}

/// How the database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Read/write, creating the file if it does not exist
    #[default]
    ReadWriteCreate,
    /// Read/write on an existing file
    ReadWrite,
    /// Read-only on an existing file
    ReadOnly,
    /// Shared-cache in-memory database named by the data source
    Memory,
}

impl OpenMode {
    fn parse(value: &str) -> Result<Self, DriverError> {
        match value.to_ascii_lowercase().as_str() {
            "readwritecreate" => Ok(OpenMode::ReadWriteCreate),
            "readwrite" => Ok(OpenMode::ReadWrite),
            "readonly" => Ok(OpenMode::ReadOnly),
            "memory" => Ok(OpenMode::Memory),
            _ => Err(DriverError::ConnectionString(format!(
                "invalid value '{value}' for keyword 'Mode'"
            ))),
        }
    }

    fn flags(self) -> OpenFlags {
        let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        match self {
            OpenMode::ReadWriteCreate => {
                base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
            OpenMode::ReadWrite => base | OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::Memory => {
                base | OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_MEMORY
                    | OpenFlags::SQLITE_OPEN_SHARED_CACHE
            }
        }
    }
}

/// Settings parsed from a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Path to the database file (or the in-memory database name)
    pub data_source: String,
    /// Open mode
    pub mode: OpenMode,
    /// `PRAGMA foreign_keys` value applied after opening, if any
    pub foreign_keys: Option<bool>,
    /// Command timeout in seconds used when a command asks for the driver default
    pub default_timeout: Option<u32>,
}

impl ConnectionOptions {
    /// Parses a connection string.
    ///
    /// A string without `=` is taken as a plain database path. Otherwise it is
    /// a `;`-separated list of `key=value` pairs; keys are case-insensitive and
    /// spaces inside keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::ConnectionString` for empty strings, malformed
    /// pairs, unsupported keywords, invalid values or a missing data source.
    /// Error messages name keywords but never echo values.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbdata::core::db::ConnectionOptions;
    ///
    /// let options = ConnectionOptions::parse("Data Source=app.db;Default Timeout=30").unwrap();
    /// assert_eq!(options.data_source, "app.db");
    /// assert_eq!(options.default_timeout, Some(30));
    /// ```
    pub fn parse(connection_string: &str) -> Result<Self, DriverError> {
        let trimmed = connection_string.trim();
        if trimmed.is_empty() {
            return Err(DriverError::ConnectionString(
                "connection string is empty".to_string(),
            ));
        }
        if is_bare_path(trimmed) {
            return Ok(Self::for_path(trimmed));
        }

        let mut options = Self::for_path("");
        for pair in split_pairs(trimmed)?.into_iter().map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                DriverError::ConnectionString("expected a key=value pair".to_string())
            })?;
            let value = unquote(value.trim());
            match normalize_key(key).as_str() {
                "datasource" | "filename" => options.data_source = value.to_string(),
                "mode" => options.mode = OpenMode::parse(value)?,
                "foreignkeys" => options.foreign_keys = Some(parse_bool(key, value)?),
                "defaulttimeout" | "commandtimeout" => {
                    let seconds = value.parse::<u32>().map_err(|_| {
                        DriverError::ConnectionString(format!(
                            "invalid value for keyword '{}'",
                            key.trim()
                        ))
                    })?;
                    options.default_timeout = Some(seconds);
                }
                _ => {
                    return Err(DriverError::ConnectionString(format!(
                        "keyword '{}' is not supported",
                        key.trim()
                    )))
                }
            }
        }

        if options.data_source.is_empty() {
            return Err(DriverError::ConnectionString(
                "keyword 'Data Source' is required".to_string(),
            ));
        }
        Ok(options)
    }

    fn for_path(path: &str) -> Self {
        ConnectionOptions {
            data_source: path.to_string(),
            mode: OpenMode::default(),
            foreign_keys: None,
            default_timeout: None,
        }
    }

    /// Opens a new SQLite connection with these options
    pub(crate) fn open(&self) -> Result<Connection, DriverError> {
        let connection = Connection::open_with_flags(&self.data_source, self.mode.flags())?;
        if let Some(enabled) = self.foreign_keys {
            connection.pragma_update(None, "foreign_keys", enabled)?;
        }
        Ok(connection)
    }
}

const KEYWORDS: &[&str] = &[
    "datasource",
    "filename",
    "mode",
    "foreignkeys",
    "defaulttimeout",
    "commandtimeout",
];

/// A single segment whose text before `=` is no keyword (or that has no `=`)
/// names a database file
fn is_bare_path(text: &str) -> bool {
    match text.split_once('=') {
        None => true,
        Some((key, _)) => !text.contains(';') && !KEYWORDS.contains(&normalize_key(key).as_str()),
    }
}

/// Splits on `;` outside of quoted values.
///
/// A value is quoted when its first non-blank character after `=` is `'` or
/// `"`; quotes anywhere else are ordinary characters.
fn split_pairs(text: &str) -> Result<Vec<&str>, DriverError> {
    let mut pairs = Vec::new();
    let mut start = 0;
    let mut quote = None;
    let mut in_value = false;
    let mut at_value_start = false;

    for (index, c) in text.char_indices() {
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            ';' => {
                pairs.push(&text[start..index]);
                start = index + 1;
                in_value = false;
                at_value_start = false;
            }
            '=' if !in_value => {
                in_value = true;
                at_value_start = true;
            }
            '\'' | '"' if at_value_start => {
                quote = Some(c);
                at_value_start = false;
            }
            c if c.is_whitespace() => {}
            _ => at_value_start = false,
        }
    }

    if quote.is_some() {
        return Err(DriverError::ConnectionString(
            "unterminated quoted value".to_string(),
        ));
    }
    pairs.push(&text[start..]);
    Ok(pairs)
}

fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_bool(key: &str, value: &str) -> Result<bool, DriverError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(DriverError::ConnectionString(format!(
            "invalid value for keyword '{}'",
            key.trim()
        ))),
    }
}

/// Marks a connection handle as open for as long as it is alive.
#[derive(Debug)]
pub(crate) struct OpenFlag(Arc<AtomicBool>);

impl OpenFlag {
    /// Claims `state`; `None` if it is already claimed.
    fn acquire(state: &Arc<AtomicBool>) -> Option<Self> {
        if state.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(OpenFlag(Arc::clone(state)))
        }
    }

    fn detached() -> Self {
        OpenFlag(Arc::new(AtomicBool::new(true)))
    }
}

impl Drop for OpenFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An open SQLite session. Dropping it closes the connection.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    default_timeout: Option<u32>,
    // Must stay the last field: the flag is cleared only after the connection is gone.
    _open: OpenFlag,
}

impl Session {
    pub(crate) fn open(connection_string: &str, open: OpenFlag) -> Result<Self, DriverError> {
        let options = ConnectionOptions::parse(connection_string)?;
        let connection = options.open()?;
        debug!(mode = ?options.mode, "connection opened");
        Ok(Session {
            connection,
            default_timeout: options.default_timeout,
            _open: open,
        })
    }

    /// The underlying SQLite connection
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Driver default command timeout taken from the connection string
    pub fn default_timeout(&self) -> Option<u32> {
        self.default_timeout
    }

    /// Runs `op` with `timeout` enforced on this session.
    pub(crate) fn run<T>(
        &self,
        timeout: CommandTimeout,
        op: impl FnOnce(&Connection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let deadline = Deadline::install(&self.connection, timeout.effective(self.default_timeout));
        op(&self.connection).map_err(|err| deadline.classify(err))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("connection closed");
    }
}

/// Handle to the primary database connection.
///
/// The handle is closed between calls. `open` hands out a `Session` and the
/// handle reports itself open until that session is dropped, wherever it
/// ended up (a local scope or a streaming reader).
#[derive(Debug, Default)]
pub struct DbConnection {
    open: Arc<AtomicBool>,
}

impl DbConnection {
    /// Creates a closed connection handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session on this handle.
    ///
    /// # Errors
    ///
    /// `DriverError::ConnectionBusy` if a previous session (a data reader) is
    /// still alive, otherwise whatever parsing or opening reports.
    pub fn open(&self, connection_string: &str) -> Result<Session, DriverError> {
        let flag = OpenFlag::acquire(&self.open).ok_or(DriverError::ConnectionBusy)?;
        Session::open(connection_string, flag)
    }

    /// Checks whether a session is currently open on this handle
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Dedicated connection holding an open transaction.
///
/// Commit and rollback consume the value, so the connection is closed
/// whatever the outcome of the final statement. SQLite discards uncommitted
/// work when a connection closes, so dropping an active transaction rolls it
/// back.
#[derive(Debug)]
pub struct TransactionConnection {
    session: Session,
}

impl TransactionConnection {
    /// Opens a new connection and issues `BEGIN` on it
    pub fn begin(connection_string: &str) -> Result<Self, DriverError> {
        let session = Session::open(connection_string, OpenFlag::detached())?;
        session.connection().execute_batch("BEGIN")?;
        debug!("transaction started");
        Ok(TransactionConnection { session })
    }

    /// The session the transaction runs on
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Commits and closes the transaction connection
    pub fn commit(self) -> Result<(), DriverError> {
        self.finish("COMMIT")
    }

    /// Rolls back and closes the transaction connection
    pub fn rollback(self) -> Result<(), DriverError> {
        self.finish("ROLLBACK")
    }

    fn finish(self, statement: &'static str) -> Result<(), DriverError> {
        let result = self.session.connection().execute_batch(statement);
        debug!(statement, ok = result.is_ok(), "transaction finished");
        result.map_err(DriverError::from)
    }
}
