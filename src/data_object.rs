//! Data access object.
//!
//! `DataAccessObject` owns the primary connection handle, an optional
//! transaction connection and the encrypted connection string. Outside of a
//! transaction every call opens the primary connection, runs one command and
//! closes it again; the only exception is `get_data_reader`, whose connection
//! stays open until the reader is exhausted, closed or dropped.
//!
//! An instance has a single logical owner. It does no internal locking and
//! is not meant to be shared between threads.

use crate::config::DbDataSettings;
use crate::core::db::query::{self, Command, CommandTimeout, ExecutionMode, QueryOptions};
use crate::core::db::{
    schema, CancellationToken, DataReader, DataSet, DataTable, DbConnection, ReaderBehavior,
    TransactionConnection, TransactionState, Value,
};
use crate::core::{DbDataError, DriverError, Result};
use crate::vault::ConnectionStringVault;
use rusqlite::Connection;
use std::fmt;
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

/// Convenience layer over a SQLite database
pub struct DataAccessObject {
    connection: DbConnection,
    transaction: Option<TransactionConnection>,
    vault: ConnectionStringVault,
    log_failures: bool,
    released: bool,
}

impl DataAccessObject {
    /// Creates an object for `connection_string` with failure logging enabled
    pub fn new(connection_string: &str) -> Result<Self> {
        let mut object = Self::unconfigured(true);
        object.vault.set(connection_string)?;
        Ok(object)
    }

    /// Creates an object from settings; the connection string may be set later
    pub fn with_settings(settings: &DbDataSettings) -> Result<Self> {
        let mut object = Self::unconfigured(settings.allow_exception_logging);
        if let Some(connection_string) = &settings.connection_string {
            object.vault.set(connection_string)?;
        }
        Ok(object)
    }

    fn unconfigured(log_failures: bool) -> Self {
        DataAccessObject {
            connection: DbConnection::new(),
            transaction: None,
            vault: ConnectionStringVault::new(),
            log_failures,
            released: false,
        }
    }

    /// Replaces the connection string and disposes the previous connection handle.
    ///
    /// A data reader still running on the old handle keeps its own connection
    /// until it is dropped.
    pub fn set_connection_string(&mut self, connection_string: &str) -> Result<()> {
        self.ensure_live()?;
        self.connection = DbConnection::new();
        self.vault.set(connection_string)
    }

    /// Decrypted connection string
    pub fn connection_string(&self) -> Result<String> {
        self.ensure_live()?;
        self.vault.get()
    }

    /// Whether the primary connection is open right now
    pub fn is_connection_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn transaction_state(&self) -> TransactionState {
        if self.transaction.is_some() {
            TransactionState::Active
        } else {
            TransactionState::Idle
        }
    }

    /// Runs a statement and returns the number of affected rows
    pub fn execute(&self, query: &str, options: QueryOptions) -> Result<usize> {
        self.run("Execute", &mut Command::new(query), options, query::execute_non_query)
    }

    /// Returns the first column of the first row, or NULL
    pub fn get_scalar(&self, query: &str, options: QueryOptions) -> Result<Value> {
        self.run("GetScalar", &mut Command::new(query), options, query::execute_scalar)
    }

    /// `execute` that can be stopped through `cancel` from another thread.
    ///
    /// A cancelled command fails with a wrapped `DriverError::Cancelled`; the
    /// timeout contract is the same as for `execute`.
    pub fn execute_cancellable(
        &self,
        query: &str,
        options: QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.run("Execute", &mut Command::new(query), options, |conn, command| {
            cancel.run(conn, || query::execute_non_query(conn, command))
        })
    }

    /// `get_scalar` that can be stopped through `cancel` from another thread
    pub fn get_scalar_cancellable(
        &self,
        query: &str,
        options: QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.run("GetScalar", &mut Command::new(query), options, |conn, command| {
            cancel.run(conn, || query::execute_scalar(conn, command))
        })
    }

    /// Runs a prebuilt command and returns the number of affected rows.
    ///
    /// An explicit timeout in `options` is recorded on `command` before it
    /// runs; with the default sentinel the command's own timeout (if any) is
    /// used.
    pub fn execute_command(&self, command: &mut Command, options: QueryOptions) -> Result<usize> {
        self.run("ExecuteCommand", command, options, query::execute_non_query)
    }

    /// Runs a batch and collects one table per result set.
    ///
    /// Tables are named `Table`, `Table1`, ... unless `table_names` provides
    /// names, which are applied in order.
    pub fn fill_data_set(&self, query: &str, options: QueryOptions, table_names: &[&str]) -> Result<DataSet> {
        self.run("FillDataSet", &mut Command::new(query), options, |conn, command| {
            query::fill_data_set(conn, command, table_names)
        })
    }

    /// First result table of a batch
    pub fn fill_data_table(&self, query: &str, options: QueryOptions) -> Result<DataTable> {
        self.run("FillDataTable", &mut Command::new(query), options, query::fill_data_table)
    }

    /// Opens the primary connection and streams the rows of `query`.
    ///
    /// The connection stays open after this returns and is closed by the
    /// reader. If preparing the statement fails the connection is closed
    /// before the error is returned.
    pub fn get_data_reader(&self, query: &str, behavior: ReaderBehavior, timeout: i32) -> Result<DataReader> {
        self.ensure_live()?;
        let mut command = Command::new(query);
        command.apply(CommandTimeout::try_from(timeout)?);

        let connection_string = Zeroizing::new(self.vault.get()?);
        self.connection
            .open(&connection_string)
            .and_then(|session| DataReader::spawn(session, command, behavior, self.log_failures))
            .map_err(|source| self.failure("GetDataReader", query, source))
    }

    /// Fetches a schema collection (see `core::db::schema`)
    pub fn get_schema(&self, collection: Option<&str>, restrictions: &[Option<&str>]) -> Result<DataTable> {
        let name = collection.unwrap_or(schema::METADATA_COLLECTIONS);
        let mut command = Command::new(format!("GetSchema({name})"));
        self.run("GetSchema", &mut command, QueryOptions::default(), |conn, _| {
            schema::get_schema(conn, collection, restrictions)
        })
    }

    pub fn execute_in_transaction(&self, query: &str) -> Result<usize> {
        self.execute(query, QueryOptions::transactional())
    }

    pub fn get_scalar_in_transaction(&self, query: &str) -> Result<Value> {
        self.get_scalar(query, QueryOptions::transactional())
    }

    pub fn execute_command_in_transaction(&self, command: &mut Command) -> Result<usize> {
        self.execute_command(command, QueryOptions::transactional())
    }

    pub fn fill_data_set_in_transaction(&self, query: &str, table_names: &[&str]) -> Result<DataSet> {
        self.fill_data_set(query, QueryOptions::transactional(), table_names)
    }

    pub fn fill_data_table_in_transaction(&self, query: &str) -> Result<DataTable> {
        self.fill_data_table(query, QueryOptions::transactional())
    }

    /// Starts a transaction on a dedicated connection.
    ///
    /// Uses `connection_string` when given, otherwise the object's own.
    /// Returns `false` (after logging) when the transaction could not be
    /// started, including when another transaction is still active.
    pub fn begin_transaction(&mut self, connection_string: Option<&str>) -> bool {
        match self.try_begin_transaction(connection_string) {
            Ok(()) => true,
            // Already logged by `failure`
            Err(DbDataError::Command { .. }) => false,
            Err(DbDataError::TransactionAlreadyActive) => {
                warn!("BeginTransaction rejected: a transaction is already active");
                false
            }
            Err(err) => {
                if self.log_failures {
                    error!(operation = "BeginTransaction", error = %err, "Error at BeginTransaction");
                }
                false
            }
        }
    }

    /// Starts a transaction on a dedicated connection.
    ///
    /// # Errors
    ///
    /// `DbDataError::TransactionAlreadyActive` if a transaction is already
    /// open (it is left untouched); a wrapped driver error if the connection
    /// cannot be opened or `BEGIN` fails.
    pub fn try_begin_transaction(&mut self, connection_string: Option<&str>) -> Result<()> {
        self.ensure_live()?;
        if self.transaction.is_some() {
            return Err(DbDataError::TransactionAlreadyActive);
        }

        let connection_string = match connection_string {
            Some(value) => Zeroizing::new(value.to_string()),
            None => Zeroizing::new(self.vault.get()?),
        };
        let transaction = TransactionConnection::begin(&connection_string)
            .map_err(|source| self.failure("BeginTransaction", "BEGIN", source))?;
        self.transaction = Some(transaction);
        Ok(())
    }

    /// Commits the active transaction and closes its connection.
    ///
    /// The transaction is released even when the commit fails.
    pub fn commit_transaction(&mut self) -> Result<()> {
        self.finish_transaction("CommitTransaction", TransactionConnection::commit)
    }

    /// Rolls back the active transaction and closes its connection.
    ///
    /// The transaction is released even when the rollback fails.
    pub fn rollback_transaction(&mut self) -> Result<()> {
        self.finish_transaction("RollbackTransaction", TransactionConnection::rollback)
    }

    /// Releases the connection handles and the stored connection string.
    ///
    /// An active transaction is discarded, which rolls it back. Calling this
    /// more than once is a no-op; every other operation fails with
    /// `DbDataError::Disposed` afterwards.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.transaction.take().is_some() {
            debug!("active transaction discarded on release");
        }
        self.connection = DbConnection::new();
        self.vault.clear();
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn finish_transaction(
        &mut self,
        operation: &'static str,
        finish: fn(TransactionConnection) -> std::result::Result<(), DriverError>,
    ) -> Result<()> {
        self.ensure_live()?;
        let Some(transaction) = self.transaction.take() else {
            if self.log_failures {
                error!(operation, "Error at {}: no active transaction", operation);
            }
            return Err(DbDataError::NoActiveTransaction);
        };

        finish(transaction)
            .map_err(|source| self.failure(operation, &format!("Error at {operation}"), source))
    }

    /// Validates the timeout, picks the connection for `options.mode` and runs `op`.
    ///
    /// In direct mode the session lives only inside this call.
    fn run<T>(
        &self,
        operation: &'static str,
        command: &mut Command,
        options: QueryOptions,
        op: impl FnOnce(&Connection, &Command) -> std::result::Result<T, DriverError>,
    ) -> Result<T> {
        self.ensure_live()?;
        command.apply(CommandTimeout::try_from(options.timeout)?);
        let command = &*command;

        let outcome = match options.mode {
            ExecutionMode::Direct => {
                let connection_string = Zeroizing::new(self.vault.get()?);
                self.connection.open(&connection_string).and_then(|session| {
                    session.run(command.effective_timeout(), |conn| op(conn, command))
                })
            }
            ExecutionMode::Transactional => {
                let transaction = self
                    .transaction
                    .as_ref()
                    .ok_or(DbDataError::NoActiveTransaction)?;
                transaction
                    .session()
                    .run(command.effective_timeout(), |conn| op(conn, command))
            }
        };

        outcome.map_err(|source| self.failure(operation, command.text(), source))
    }

    fn failure(&self, operation: &str, command_text: &str, source: DriverError) -> DbDataError {
        if self.log_failures {
            error!(operation, command = %command_text, error = %source, "Error at {}", operation);
        }
        DbDataError::Command {
            command_text: command_text.to_string(),
            source,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            Err(DbDataError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl Drop for DataAccessObject {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DataAccessObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAccessObject")
            .field("connection_open", &self.is_connection_open())
            .field("transaction_state", &self.transaction_state())
            .field("log_failures", &self.log_failures)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
