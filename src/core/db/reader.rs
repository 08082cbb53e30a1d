/// Streaming Reader Module
///
/// A `DataReader` streams the rows of one query from a worker thread that
/// owns the session. The connection stays open while rows are pending and is
/// closed once the rows are exhausted, the reader is closed, or it is dropped.

use crate::core::db::connection::Session;
use crate::core::db::query::{read_row, Command, Deadline, Value};
use crate::core::{DbDataError, DriverError, Result};
use rusqlite::{params_from_iter, InterruptHandle};
use std::fmt;
use std::sync::mpsc;
use std::thread;
use tracing::{error, warn};

/// Rows buffered between the worker and the reader
const READER_BUFFER_ROWS: usize = 64;

/// What the reader produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderBehavior {
    /// Every row of the result
    #[default]
    Default,
    /// At most one row
    SingleRow,
    /// Column names only, no rows
    SchemaOnly,
}

type RowMessage = std::result::Result<Vec<Value>, DriverError>;
type HeaderMessage = std::result::Result<(Vec<String>, InterruptHandle), DriverError>;

/// Forward-only row cursor over a query result
pub struct DataReader {
    columns: Vec<String>,
    command_text: String,
    log_failures: bool,
    rows: Option<mpsc::Receiver<RowMessage>>,
    interrupt: Option<InterruptHandle>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DataReader {
    /// Starts streaming `command` on `session`.
    ///
    /// Returns once the statement is prepared and its columns are known. If
    /// that fails the worker has already dropped the session, so the
    /// connection is closed before the error reaches the caller.
    pub(crate) fn spawn(
        session: Session,
        command: Command,
        behavior: ReaderBehavior,
        log_failures: bool,
    ) -> std::result::Result<Self, DriverError> {
        let (header_tx, header_rx) = mpsc::channel::<HeaderMessage>();
        let (row_tx, row_rx) = mpsc::sync_channel::<RowMessage>(READER_BUFFER_ROWS);
        let command_text = command.text().to_string();

        let worker = thread::Builder::new()
            .name("dbdata-reader".to_string())
            .spawn(move || stream_rows(session, &command, behavior, header_tx, row_tx))
            .map_err(DriverError::Worker)?;

        match header_rx.recv() {
            Ok(Ok((columns, interrupt))) => Ok(DataReader {
                columns,
                command_text,
                log_failures,
                rows: Some(row_rx),
                interrupt: Some(interrupt),
                worker: Some(worker),
            }),
            Ok(Err(err)) => {
                join_worker(worker);
                Err(err)
            }
            Err(_) => {
                join_worker(worker);
                Err(DriverError::ReaderTerminated)
            }
        }
    }

    /// Column names of the result
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Command text the reader was created for
    pub fn command_text(&self) -> &str {
        &self.command_text
    }

    /// Reads the next row; `Ok(None)` once the result is exhausted.
    ///
    /// # Errors
    ///
    /// Failures raised while stepping the statement are returned as
    /// `DbDataError::Command`; the reader is closed afterwards.
    pub fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let received = match &self.rows {
            Some(rows) => rows.recv(),
            None => return Ok(None),
        };

        match received {
            Ok(Ok(row)) => Ok(Some(row)),
            Ok(Err(source)) => {
                self.shutdown();
                Err(self.failure(source))
            }
            Err(_) => {
                self.shutdown();
                Ok(None)
            }
        }
    }

    /// Whether the reader has released its connection
    pub fn is_closed(&self) -> bool {
        self.worker.is_none()
    }

    /// Stops reading and closes the connection
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.rows.take();
        if let Some(worker) = self.worker.take() {
            if let Some(interrupt) = self.interrupt.take() {
                if !worker.is_finished() {
                    interrupt.interrupt();
                }
            }
            join_worker(worker);
        }
    }

    fn failure(&self, source: DriverError) -> DbDataError {
        if self.log_failures {
            error!(
                operation = "GetDataReader",
                command = %self.command_text,
                error = %source,
                "Error at GetDataReader"
            );
        }
        DbDataError::Command {
            command_text: self.command_text.clone(),
            source,
        }
    }
}

impl Iterator for DataReader {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for DataReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DataReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataReader")
            .field("columns", &self.columns)
            .field("command_text", &self.command_text)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn join_worker(worker: thread::JoinHandle<()>) {
    if worker.join().is_err() {
        warn!("data reader worker panicked");
    }
}

/// Worker body. Owns the session; the connection closes when this returns.
fn stream_rows(
    session: Session,
    command: &Command,
    behavior: ReaderBehavior,
    header_tx: mpsc::Sender<HeaderMessage>,
    row_tx: mpsc::SyncSender<RowMessage>,
) {
    let conn = session.connection();
    let deadline = Deadline::install(
        conn,
        command.effective_timeout().effective(session.default_timeout()),
    );

    let mut stmt = match conn.prepare(command.text()) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = header_tx.send(Err(deadline.classify(err.into())));
            return;
        }
    };
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let column_count = columns.len();

    let mut rows = match stmt.query(params_from_iter(command.params())) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = header_tx.send(Err(deadline.classify(err.into())));
            return;
        }
    };

    if header_tx.send(Ok((columns, conn.get_interrupt_handle()))).is_err() {
        return;
    }
    if behavior == ReaderBehavior::SchemaOnly {
        return;
    }

    loop {
        // Time spent waiting on the consumer does not count against the timeout
        deadline.restart();
        let message = match rows.next() {
            Ok(Some(row)) => read_row(row, column_count).map_err(DriverError::from),
            Ok(None) => break,
            Err(err) => Err(DriverError::from(err)),
        };
        let failed = message.is_err();
        let message = message.map_err(|err| deadline.classify(err));
        if row_tx.send(message).is_err() || failed || behavior == ReaderBehavior::SingleRow {
            break;
        }
    }
}
