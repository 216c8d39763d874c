//! Error types for fleet operations

use crate::dispatcher::TaskError;
use crate::registry::TokenFailure;
use crate::store::StoreError;
use kestrel_dhcp::DhcpError;
use thiserror::Error;

/// Errors surfaced by orchestration operations.
///
/// Per-node problems inside a batch (a node that did not ack a reboot, a
/// port the switch refused) are reported in the operation's outcome, not
/// here. These variants abort the operation as a whole.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Some tokens of a node-set expression could not be resolved
    #[error("{}", format_failures(.0))]
    Resolution(Vec<TokenFailure>),

    /// The requester declined to act on nodes owned by someone else
    #[error("aborted: {} owned by another user", .0.join(", "))]
    OwnershipConflict(Vec<String>),

    #[error("image '{0}' not found")]
    ImageNotFound(String),

    /// Nodes still unreachable when a wait timed out
    #[error("timed out waiting for {}", .0.join(", "))]
    NodesNotReady(Vec<String>),

    #[error("no device named '{0}'")]
    DeviceNotFound(String),

    #[error("name '{0}' is already used by another device")]
    NameTaken(String),

    #[error("invalid device name '{0}'")]
    InvalidName(String),

    /// The DHCP daemon could not be reloaded; address state is unknown
    #[error("DHCP reload failed: {0}")]
    DhcpReload(String),

    #[error(transparent)]
    Dhcp(DhcpError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),

    /// The orchestration loop has stopped
    #[error("fleet orchestrator is shutting down")]
    ShuttingDown,
}

impl From<DhcpError> for FleetError {
    fn from(err: DhcpError) -> Self {
        match err {
            DhcpError::ReloadFailed(msg) => FleetError::DhcpReload(msg),
            other => FleetError::Dhcp(other),
        }
    }
}

fn format_failures(failures: &[TokenFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FailureReason;

    #[test]
    fn test_resolution_message_names_tokens() {
        let err = FleetError::Resolution(vec![
            TokenFailure::new("rpi9", FailureReason::NotFound),
            TokenFailure::new("sw1", FailureReason::NotANode),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("rpi9"));
        assert!(msg.contains("sw1"));
    }

    #[test]
    fn test_reload_failure_is_distinguished() {
        let err: FleetError = DhcpError::ReloadFailed("exit 1".into()).into();
        assert!(matches!(err, FleetError::DhcpReload(_)));

        let err: FleetError = DhcpError::ConfigError("bad".into()).into();
        assert!(matches!(err, FleetError::Dhcp(_)));
    }
}
