//! dhcpd.conf generation
//!
//! Output is a pure function of its inputs: reservations are emitted in MAC
//! order, so two renders of the same registry are byte-identical.

use crate::config::{DhcpConfig, Reservation};
use crate::error::{DhcpError, Result};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::net::Ipv4Addr;

const HEADER: &str = "# Generated by kestrel. Do not edit.\n";

/// Render the daemon configuration.
///
/// Reservations outside the managed subnet are rejected, as are two
/// reservations for one address. A reservation may sit inside the dynamic
/// pool; dhcpd keeps serving it to its owner.
pub fn render(config: &DhcpConfig, reservations: &[Reservation]) -> Result<String> {
    config.validate()?;

    let mut sorted: Vec<&Reservation> = reservations.iter().collect();
    sorted.sort_by_key(|r| r.mac);

    let mut by_ip: BTreeMap<Ipv4Addr, &Reservation> = BTreeMap::new();
    for r in &sorted {
        if !config.contains(r.ip) {
            return Err(DhcpError::InvalidIp(format!(
                "{} reserved for {} is outside the managed subnet",
                r.ip, r.mac
            )));
        }
        if let Some(first) = by_ip.insert(r.ip, r) {
            return Err(DhcpError::DuplicateReservation {
                ip: r.ip,
                first: first.mac.to_string(),
                second: r.mac.to_string(),
            });
        }
    }

    let mut out = String::from(HEADER);
    // Writing into a String cannot fail
    let _ = writeln!(out, "subnet {} netmask {} {{", config.subnet, config.netmask);
    if let Some(router) = config.router {
        let _ = writeln!(out, "    option routers {};", router);
    }
    if !config.dns_servers.is_empty() {
        let servers: Vec<String> = config.dns_servers.iter().map(|s| s.to_string()).collect();
        let _ = writeln!(out, "    option domain-name-servers {};", servers.join(", "));
    }
    // validate() guarantees both bounds
    if let (Some(start), Some(end)) = (config.pool_start, config.pool_end) {
        let _ = writeln!(out, "    range {} {};", start, end);
    }
    let _ = writeln!(out, "    default-lease-time {};", config.lease_time);
    let _ = writeln!(out, "    max-lease-time {};", config.lease_time);
    if let Some(server) = config.next_server {
        let _ = writeln!(out, "    next-server {};", server);
    }
    if let Some(filename) = &config.boot_filename {
        let _ = writeln!(out, "    filename \"{}\";", filename);
    }
    out.push_str("}\n");

    for r in sorted {
        let _ = writeln!(out, "host kestrel-{} {{", r.mac.hex());
        let _ = writeln!(out, "    hardware ethernet {};", r.mac);
        let _ = writeln!(out, "    fixed-address {};", r.ip);
        if let Some(name) = r.hostname.as_deref().map(sanitize_hostname).filter(|n| !n.is_empty()) {
            let _ = writeln!(out, "    option host-name \"{}\";", name);
        }
        out.push_str("}\n");
    }

    Ok(out)
}

/// Keep only characters valid in a host name label
fn sanitize_hostname(name: &str) -> String {
    name.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
