//! Service lifecycle guard
//!
//! The firmware service holds the MCU serial ports open, so it has to be
//! stopped before anything talks to a bootloader. [`ServiceGuard`] stops it
//! on acquisition and starts it again exactly once when released, whether
//! that happens through [`ServiceGuard::release`], an early return, or a
//! panic unwinding through the scope.
//!
//! A failed stop is an error: nothing has been touched yet. A failed
//! restart is only reported, so it can never replace the outcome of the
//! operation that ran inside the scope.

use kflash_core::console::Console;
use kflash_core::error::ServiceError;
use kflash_core::service::ServiceControl;
use log::{info, warn};

/// A restart that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartFailure {
    /// Why the start command failed
    pub message: String,
}

/// Scoped "service stopped" state
pub struct ServiceGuard<'a> {
    service: &'a dyn ServiceControl,
    console: &'a dyn Console,
    released: bool,
}

impl<'a> ServiceGuard<'a> {
    /// Stop the service
    pub fn acquire(
        service: &'a dyn ServiceControl,
        console: &'a dyn Console,
    ) -> Result<Self, ServiceError> {
        console.phase("Service", &format!("Stopping {}...", service.name()));
        service.stop()?;
        info!("Service '{}' stopped", service.name());
        Ok(Self {
            service,
            console,
            released: false,
        })
    }

    /// Start the service again, reporting rather than returning a failure
    pub fn release(mut self) -> Option<RestartFailure> {
        self.restart()
    }

    fn restart(&mut self) -> Option<RestartFailure> {
        if self.released {
            return None;
        }
        self.released = true;

        let name = self.service.name();
        match self.service.start() {
            Ok(()) => {
                info!("Service '{}' started", name);
                self.console.phase("Service", &format!("{} restarted", name));
                None
            }
            Err(e) => {
                warn!("Service restart failed: {}", e);
                self.console.warn(&format!(
                    "{}. Start it manually: sudo systemctl start {}",
                    e, name
                ));
                Some(RestartFailure {
                    message: e.to_string(),
                })
            }
        }
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        self.restart();
    }
}

/// Value produced inside a guarded scope plus the restart outcome
#[derive(Debug)]
pub struct Guarded<T> {
    /// What the operation returned
    pub value: T,
    /// Set if the service could not be restarted
    pub restart_failure: Option<RestartFailure>,
}

/// Run `op` with the service stopped
pub fn with_service_stopped<T>(
    service: &dyn ServiceControl,
    console: &dyn Console,
    op: impl FnOnce() -> T,
) -> Result<Guarded<T>, ServiceError> {
    let guard = ServiceGuard::acquire(service, console)?;
    let value = op();
    let restart_failure = guard.release();
    Ok(Guarded {
        value,
        restart_failure,
    })
}
