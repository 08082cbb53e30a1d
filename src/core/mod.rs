/// Core Module for DbData
///
/// This module contains the database plumbing the data access object is
/// built on: connection sessions, command execution, streaming readers,
/// schema collections and the shared error types.

pub mod db;
pub mod error;

// Re-export commonly used types for convenience
pub use error::{DbDataError, DriverError, Result};
