//! Adapter around one instance's systemd unit. All state transitions go
//! through here; nothing else in the crate talks to systemctl.

use std::{
    io,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use crate::{privileges, settings::Settings};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_ITERATIONS: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("systemctl {action} {unit} exited with code {code}")]
    CommandFailed {
        action: String,
        unit: String,
        code: i32,
    },
    #[error("Service action '{action}' on '{unit}' did not reach the expected state")]
    TransitionFailed { action: String, unit: String },
    #[error(transparent)]
    Privilege(#[from] privileges::PrivilegeError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
}

impl UnitAction {
    pub fn verb(self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
        }
    }

    /// The active-state the unit must settle into for the action to have
    /// succeeded.
    fn expects_active(self) -> bool {
        !matches!(self, UnitAction::Stop)
    }
}

/// One instance's systemd unit, e.g. `mcserver@survival`.
#[derive(Debug, Clone)]
pub struct ServiceUnit {
    unit: String,
}

impl ServiceUnit {
    pub fn new(settings: &Settings, instance: &str) -> Self {
        Self {
            unit: format!("{}{}", settings.system.unit_prefix, instance),
        }
    }

    pub fn name(&self) -> &str {
        &self.unit
    }

    pub fn is_active(&self) -> Result<bool, ServiceError> {
        Ok(self.active_state()? == "active")
    }

    pub fn is_enabled(&self) -> Result<bool, ServiceError> {
        let status = Command::new("systemctl")
            .args(["is-enabled", "--quiet", &self.unit])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }

    fn active_state(&self) -> Result<String, ServiceError> {
        let output = Command::new("systemctl")
            .args(["is-active", &self.unit])
            .stderr(Stdio::null())
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Apply a start/stop/restart and block until the unit settles, then
    /// verify it settled where the action says it must. systemd accepting
    /// the command is not enough: a stop it silently rejects would otherwise
    /// look like success.
    pub fn set_status(&self, action: UnitAction) -> Result<(), ServiceError> {
        let _root = privileges::run_elevated()?;
        self.run_systemctl(action.verb())?;

        for _ in 0..POLL_ITERATIONS {
            let state = self.active_state()?;
            if state != "activating" && state != "deactivating" && state != "reloading" {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let active = self.is_active()?;
        if active != action.expects_active() {
            return Err(ServiceError::TransitionFailed {
                action: action.verb().to_string(),
                unit: self.unit.clone(),
            });
        }
        tracing::debug!(unit = %self.unit, action = action.verb(), "unit transition settled");
        Ok(())
    }

    /// Toggle start-at-boot.
    pub fn set_persistence(&self, enabled: bool) -> Result<(), ServiceError> {
        let _root = privileges::run_elevated()?;
        self.run_systemctl(if enabled { "enable" } else { "disable" })
    }

    fn run_systemctl(&self, verb: &str) -> Result<(), ServiceError> {
        let status = Command::new("systemctl")
            .args([verb, &self.unit])
            .stdout(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(ServiceError::CommandFailed {
                action: verb.to_string(),
                unit: self.unit.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_name_combines_prefix_and_instance() {
        let settings = Settings::default();
        let unit = ServiceUnit::new(&settings, "survival");
        assert_eq!(unit.name(), "mcserver@survival");
    }

    #[test]
    fn stop_expects_inactive_everything_else_active() {
        assert!(UnitAction::Start.expects_active());
        assert!(UnitAction::Restart.expects_active());
        assert!(!UnitAction::Stop.expects_active());
    }
}
