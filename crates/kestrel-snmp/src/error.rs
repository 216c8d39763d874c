//! Error types for switch management operations

use std::net::Ipv4Addr;
use thiserror::Error;

/// Error type for SNMP operations
#[derive(Debug, Error)]
pub enum SnmpError {
    /// Switch did not answer (or answered with a transport failure)
    #[error("switch {0} unreachable: {1}")]
    Unreachable(Ipv4Addr, String),

    /// Request timed out
    #[error("request to {0} timed out")]
    Timeout(Ipv4Addr),

    /// The agent answered but refused or failed the request
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Response could not be understood
    #[error("unexpected response: {0}")]
    Parse(String),

    /// The switch does not implement the required MIB
    #[error("unsupported by switch {0}: {1}")]
    Unsupported(Ipv4Addr, String),

    /// Local tool missing or not executable
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl SnmpError {
    /// Connectivity failures skip the device; other errors are reported as-is
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SnmpError::Unreachable(..) | SnmpError::Timeout(_))
    }
}

/// Result type for SNMP operations
pub type Result<T> = std::result::Result<T, SnmpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let ip = Ipv4Addr::new(192, 168, 152, 2);
        let err = SnmpError::Timeout(ip);
        assert_eq!(err.to_string(), "request to 192.168.152.2 timed out");
        assert!(err.is_connectivity());

        let err = SnmpError::Parse("garbage".to_string());
        assert_eq!(err.to_string(), "unexpected response: garbage");
        assert!(!err.is_connectivity());
    }
}
