//! Interactive confirmation
//!
//! Operations touching nodes owned by someone else ask the requester first.
//! The session layer provides the real prompt; the server only sees this
//! trait.

use async_trait::async_trait;

#[async_trait]
pub trait Confirm: Send + Sync {
    /// Show `message` and return the requester's answer
    async fn confirm(&self, message: &str) -> bool;
}

/// Fixed answer, for non-interactive callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, _message: &str) -> bool {
        self.0
    }
}
