//! Error types for DHCP configuration
//!
//! This module provides error types for configuration validation, file
//! generation and daemon reload failures.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for DHCP operations
#[derive(Debug, Error)]
pub enum DhcpError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    /// Two reservations claim the same address
    #[error("duplicate reservation for {ip}: {first} and {second}")]
    DuplicateReservation {
        ip: std::net::Ipv4Addr,
        first: String,
        second: String,
    },

    /// Failed to write the generated file
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The DHCP daemon did not accept the reload
    #[error("DHCP service reload failed: {0}")]
    ReloadFailed(String),
}

/// Result type for DHCP operations
pub type Result<T> = std::result::Result<T, DhcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DhcpError::ReloadFailed("exit status 1".to_string());
        assert_eq!(err.to_string(), "DHCP service reload failed: exit status 1");

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = DhcpError::WriteFailed {
            path: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            source: io_err,
        };
        assert!(err.to_string().starts_with("failed to write /etc/dhcp/dhcpd.conf"));
    }
}
