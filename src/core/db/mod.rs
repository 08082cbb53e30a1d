/// Database Module
///
/// This module provides the SQLite plumbing for DbData, organized into
/// focused submodules.
///
/// ## Architecture
///
/// - **Cancellation** (`cancel.rs`): tokens that interrupt a running command from another thread
/// - **Connection Management** (`connection.rs`): connection strings, scoped sessions and transaction sessions
/// - **Query Execution** (`query.rs`): values, commands, timeouts and tabular results
/// - **Streaming Readers** (`reader.rs`): row cursors that own their connection until closed
/// - **Schema Collections** (`schema.rs`): metadata tables about the database structure
///
/// ## Error Handling
///
/// Functions at this level return `DriverError`. The data access object wraps
/// them into `DbDataError::Command` together with the command text.
pub mod cancel;
pub mod connection;
pub mod query;
pub mod reader;
pub mod schema;

pub use cancel::*;
pub use connection::*;
pub use query::*;
pub use reader::*;
pub use schema::*;
