//! Kestrel DHCP configuration
//!
//! Kestrel does not answer DHCP itself. It generates the configuration of
//! an ISC-style DHCP daemon from the device registry and asks that daemon to
//! reload when the configuration changed.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   DhcpConfig (subnet, router, dynamic pool)         │
//! │          +  Vec<Reservation> (MAC -> IP)            │
//! └─────────────────────────────────────────────────────┘
//!                        │ render()
//!                        ▼
//! ┌─────────────────────────────────────────────────────┐
//! │   dhcpd.conf text (byte-stable, MAC ordered)        │
//! └─────────────────────────────────────────────────────┘
//!                        │ write_atomic()
//!                        ▼
//! ┌─────────────────────────────────────────────────────┐
//! │   temp file in target dir -> rename into place      │
//! └─────────────────────────────────────────────────────┘
//!                        │ DhcpService::reload()
//!                        ▼
//!                  DHCP daemon
//! ```
//!
//! # Example
//!
//! ```
//! use kestrel_dhcp::{DhcpConfig, Reservation, render};
//! use std::net::Ipv4Addr;
//!
//! let config = DhcpConfig::new(Ipv4Addr::new(192, 168, 152, 0))
//!     .with_router(Ipv4Addr::new(192, 168, 152, 1))
//!     .with_pool_range(Ipv4Addr::new(192, 168, 152, 100), Ipv4Addr::new(192, 168, 152, 200));
//!
//! let reservations = vec![Reservation::new(
//!     "b8:27:eb:00:00:01".parse().unwrap(),
//!     Ipv4Addr::new(192, 168, 152, 10),
//! )];
//!
//! let text = render(&config, &reservations).unwrap();
//! assert!(text.contains("fixed-address 192.168.152.10;"));
//! ```

pub mod config;
pub mod error;
pub mod render;
pub mod service;
pub mod writer;

pub use config::*;
pub use error::*;
pub use render::*;
pub use service::*;
pub use writer::*;
