//! Firmware service control

use std::time::Duration;

use log::debug;

use crate::error::ServiceError;
use crate::process::{CommandRunner, CommandSpec};

/// Default systemd unit owning the MCU serial ports
pub const DEFAULT_SERVICE: &str = "klipper";

/// Timeout for one `systemctl` call
pub const SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Stops and starts the background firmware service
pub trait ServiceControl {
    /// Unit name, for messages
    fn name(&self) -> &str;

    /// Stop the service
    fn stop(&self) -> Result<(), ServiceError>;

    /// Start the service
    fn start(&self) -> Result<(), ServiceError>;
}

/// `sudo systemctl stop|start <unit>`
pub struct SystemdService<'a> {
    name: String,
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> SystemdService<'a> {
    /// Control `name` through `runner`
    pub fn new(name: impl Into<String>, runner: &'a dyn CommandRunner) -> Self {
        Self {
            name: name.into(),
            runner,
            timeout: SERVICE_TIMEOUT,
        }
    }

    fn systemctl(&self, action: &'static str) -> Result<(), ServiceError> {
        let spec = CommandSpec::new("sudo")
            .args(["systemctl", action, self.name.as_str()])
            .tty()
            .timeout(self.timeout);
        debug!("systemctl {} {}", action, self.name);
        let fail = |detail: String| ServiceError {
            action,
            service: self.name.clone(),
            detail,
        };
        let output = self.runner.run(&spec).map_err(|e| fail(e.to_string()))?;
        if output.timed_out {
            return Err(fail(format!("timed out after {}s", self.timeout.as_secs())));
        }
        if !output.success() {
            return Err(fail(output.failure_reason()));
        }
        Ok(())
    }
}

impl ServiceControl for SystemdService<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&self) -> Result<(), ServiceError> {
        self.systemctl("stop")
    }

    fn start(&self) -> Result<(), ServiceError> {
        self.systemctl("start")
    }
}

/// Whether `sudo` works without a password prompt
pub fn passwordless_sudo(runner: &dyn CommandRunner) -> bool {
    let spec = CommandSpec::new("sudo")
        .args(["-n", "true"])
        .timeout(Duration::from_secs(5));
    runner.run(&spec).map(|o| o.success()).unwrap_or(false)
}
