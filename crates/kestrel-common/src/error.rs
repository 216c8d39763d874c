use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid device kind: {0}")]
    InvalidKind(String),

    #[error("invalid power state: {0}")]
    InvalidPowerState(String),
}
