//! DHCP daemon control

use crate::error::{DhcpError, Result};
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{info, warn};

/// Something that can make the DHCP daemon pick up a new configuration.
///
/// Blocking; run it off the orchestration task.
pub trait DhcpService: Send + Sync {
    fn reload(&self) -> Result<()>;
}

/// Reload by running an external command, e.g.
/// `systemctl restart isc-dhcp-server`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDhcpService {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for CommandDhcpService {
    fn default() -> Self {
        Self {
            program: "systemctl".to_string(),
            args: vec!["restart".to_string(), "isc-dhcp-server".to_string()],
        }
    }
}

impl CommandDhcpService {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl DhcpService for CommandDhcpService {
    fn reload(&self) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| DhcpError::ReloadFailed(format!("{}: {}", self.command_line(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(command = %self.command_line(), status = %output.status, "DHCP reload command failed");
            return Err(DhcpError::ReloadFailed(format!(
                "{} exited with {}: {}",
                self.command_line(),
                output.status,
                stderr.trim()
            )));
        }

        info!(command = %self.command_line(), "DHCP service reloaded");
        Ok(())
    }
}
