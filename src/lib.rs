//! DbData: a small data access layer over SQLite.
//!
//! The entry point is [`DataAccessObject`]. It keeps its connection string
//! encrypted in memory, opens a connection per call outside of transactions,
//! and runs commands on a dedicated connection between `begin_transaction`
//! and `commit_transaction`/`rollback_transaction`.
//!
//! ```no_run
//! use dbdata::{DataAccessObject, QueryOptions};
//!
//! let mut dao = DataAccessObject::new("Data Source=app.db")?;
//! dao.execute("UPDATE t SET x = 1", QueryOptions::new())?;
//!
//! if dao.begin_transaction(None) {
//!     dao.execute_in_transaction("DELETE FROM t")?;
//!     dao.rollback_transaction()?;
//! }
//! # Ok::<(), dbdata::DbDataError>(())
//! ```

// Core infrastructure modules
pub mod config;
pub mod core;

// Public surface
pub mod data_object;
pub mod vault;

#[cfg(test)]
mod test_utils;

pub use crate::config::{load_settings, DbDataSettings};
pub use crate::core::db::{
    CancellationToken, Command, CommandTimeout, DataReader, DataSet, DataTable, ExecutionMode, QueryOptions, ReaderBehavior,
    TransactionState, Value, DEFAULT_TIMEOUT,
};
pub use crate::core::{DbDataError, DriverError, Result};
pub use crate::data_object::DataAccessObject;
pub use crate::vault::ConnectionStringVault;
