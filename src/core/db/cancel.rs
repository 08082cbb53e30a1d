/// Command Cancellation Module
///
/// A `CancellationToken` is handed to a cancellable call and kept (or cloned)
/// by whoever may want to stop it. While the command runs the token holds the
/// connection's interrupt handle; `cancel` from any thread interrupts the
/// running statement, which then fails with `DriverError::Cancelled`.
///
/// A token stays cancelled once cancelled; later calls using it fail before
/// running anything.

use crate::core::DriverError;
use rusqlite::{Connection, InterruptHandle};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    running: Option<InterruptHandle>,
}

/// Cancels a running command from another thread
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<CancelState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled and interrupts the command running under it, if any
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancelled = true;
        if let Some(handle) = &state.running {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Runs `op` on `conn` with the token attached.
    ///
    /// Fails with `DriverError::Cancelled` without calling `op` when the token
    /// is already cancelled; an interrupt caused by `cancel` is reported the
    /// same way.
    pub(crate) fn run<T>(
        &self,
        conn: &Connection,
        op: impl FnOnce() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let _attached = self.attach(conn)?;
        op().map_err(|err| self.classify(err))
    }

    fn attach(&self, conn: &Connection) -> Result<Attached<'_>, DriverError> {
        let mut state = self.lock();
        if state.cancelled {
            return Err(DriverError::Cancelled);
        }
        state.running = Some(conn.get_interrupt_handle());
        Ok(Attached { token: self })
    }

    fn classify(&self, err: DriverError) -> DriverError {
        if err.is_interrupt() && self.is_cancelled() {
            DriverError::Cancelled
        } else {
            err
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Detaches the interrupt handle when the command is done
struct Attached<'t> {
    token: &'t CancellationToken,
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.token.lock().running = None;
    }
}
