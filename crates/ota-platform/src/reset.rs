use std::str::FromStr;

use log::{error, info};
use serde::{Deserialize, Serialize};

/// Hard device restart.
pub trait ResetPrimitive: Send + Sync {
    /// Restart the device. The real implementation does not return.
    fn reset(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Reboot the whole machine.
    #[default]
    Reboot,
    /// Re-exec the current binary and exit; for supervised deployments.
    Restart,
}

impl FromStr for ResetMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reboot" => Ok(Self::Reboot),
            "restart" => Ok(Self::Restart),
            other => Err(format!("unknown reset mode '{other}'")),
        }
    }
}

pub struct SystemReset {
    mode: ResetMode,
}

impl SystemReset {
    #[must_use]
    pub fn new(mode: ResetMode) -> Self {
        Self { mode }
    }
}

impl ResetPrimitive for SystemReset {
    fn reset(&self) {
        log::logger().flush();

        match self.mode {
            ResetMode::Reboot => {
                info!("Rebooting device");
                match std::process::Command::new("reboot").status() {
                    Ok(status) if status.success() => {}
                    Ok(status) => error!("reboot exited with {status}"),
                    Err(error) => error!("failed to run reboot: {error}"),
                }
            }
            ResetMode::Restart => match std::env::current_exe() {
                Ok(exe) => {
                    info!("Restarting from: {}", exe.display());
                    if let Err(error) = std::process::Command::new(&exe).spawn() {
                        error!("failed to restart {}: {error}", exe.display());
                    }
                }
                Err(error) => error!("failed to get current executable: {error}"),
            },
        }

        log::logger().flush();
        std::process::exit(0);
    }
}

#[cfg(test)]
mod tests {
    use super::ResetMode;

    #[test]
    fn reset_mode_parses_known_values() {
        assert_eq!("reboot".parse::<ResetMode>(), Ok(ResetMode::Reboot));
        assert_eq!(" Restart ".parse::<ResetMode>(), Ok(ResetMode::Restart));
        assert!("halt".parse::<ResetMode>().is_err());
    }
}
