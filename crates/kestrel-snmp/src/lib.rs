//! Kestrel switch management
//!
//! This crate describes what the orchestrator needs from managed switches:
//! LLDP neighbor tables for topology discovery, and PoE port control for
//! hard reboots. The SNMP wire protocol itself is not implemented here; the
//! [`NetSnmpAgent`] adapter drives the net-snmp command line tools.
//!
//! All calls are blocking and are meant to be run off the orchestration
//! task (see the server's dispatcher).
//!
//! # Example
//!
//! ```no_run
//! use kestrel_snmp::{NetSnmpAgent, SnmpOptions, SwitchAgent, SwitchTarget};
//! use std::net::Ipv4Addr;
//!
//! # fn example() -> kestrel_snmp::Result<()> {
//! let agent = NetSnmpAgent::new(SnmpOptions::default());
//! let switch = SwitchTarget::new(
//!     "00:11:22:33:44:55".parse().unwrap(),
//!     Ipv4Addr::new(192, 168, 152, 2),
//! );
//!
//! for neighbor in agent.neighbors(&switch)? {
//!     println!("port {} -> {}", neighbor.local_port, neighbor.remote_mac);
//! }
//!
//! // Cut power on port 3
//! agent.set_port_power(&switch, 3, false)?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod error;
pub mod netsnmp;
pub mod types;

pub use agent::SwitchAgent;
pub use error::{Result, SnmpError};
pub use netsnmp::NetSnmpAgent;
pub use types::{Neighbor, SnmpOptions, SnmpVersion, SwitchTarget};
