//! Node agent client
//!
//! Each node runs a small service that accepts cooperative requests from
//! the server. A request is a single line (`REBOOT`, `BLINK 1`, `BLINK 0`)
//! answered by `OK`.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Port of the node-side service
pub const DEFAULT_AGENT_PORT: u16 = 12346;

/// How a node answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Acked,
    /// No answer within the deadline
    Timeout,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot reach {0}: {1}")]
    Connect(Ipv4Addr, String),

    #[error("unexpected answer from {0}: {1:?}")]
    Protocol(Ipv4Addr, String),
}

/// Cooperative control of a node. Blocking.
pub trait NodeAgent: Send + Sync {
    fn request_reboot(&self, ip: Ipv4Addr, timeout: Duration) -> Result<Ack, AgentError>;

    /// Start or stop blinking the node's LED, to find it in the rack
    fn blink(&self, ip: Ipv4Addr, on: bool, timeout: Duration) -> Result<Ack, AgentError>;
}

/// Talks to the node service over TCP
#[derive(Debug, Clone)]
pub struct TcpNodeAgent {
    port: u16,
}

impl Default for TcpNodeAgent {
    fn default() -> Self {
        Self::new(DEFAULT_AGENT_PORT)
    }
}

impl TcpNodeAgent {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

impl TcpNodeAgent {
    /// Send one request line and wait for `OK`
    fn exchange(&self, ip: Ipv4Addr, request: &str, timeout: Duration) -> Result<Ack, AgentError> {
        let addr = SocketAddr::from((ip, self.port));
        let connect_err = |e: std::io::Error| AgentError::Connect(ip, e.to_string());

        let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => stream,
            Err(e) if is_timeout(e.kind()) => return Ok(Ack::Timeout),
            Err(e) => return Err(connect_err(e)),
        };
        stream.set_read_timeout(Some(timeout)).map_err(connect_err)?;
        stream.set_write_timeout(Some(timeout)).map_err(connect_err)?;
        stream.write_all(format!("{}\n", request).as_bytes()).map_err(connect_err)?;

        let mut line = String::new();
        match BufReader::new(stream).read_line(&mut line) {
            Ok(0) => Err(AgentError::Protocol(ip, "connection closed".to_string())),
            Ok(_) if line.trim() == "OK" => {
                debug!(ip = %ip, request, "request acknowledged");
                Ok(Ack::Acked)
            }
            Ok(_) => Err(AgentError::Protocol(ip, line.trim().to_string())),
            Err(e) if is_timeout(e.kind()) => Ok(Ack::Timeout),
            Err(e) => Err(connect_err(e)),
        }
    }
}

impl NodeAgent for TcpNodeAgent {
    fn request_reboot(&self, ip: Ipv4Addr, timeout: Duration) -> Result<Ack, AgentError> {
        self.exchange(ip, "REBOOT", timeout)
    }

    fn blink(&self, ip: Ipv4Addr, on: bool, timeout: Duration) -> Result<Ack, AgentError> {
        self.exchange(ip, if on { "BLINK 1" } else { "BLINK 0" }, timeout)
    }
}
