//! net-snmp command line adapter
//!
//! Drives `snmpwalk`, `snmpget` and `snmpset` rather than speaking SNMP
//! natively. Reads LLDP-MIB (`lldpRemTable`, `lldpRemManAddrTable`) and
//! POWER-ETHERNET-MIB (`pethPsePortAdminEnable`).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::process::Command;

use kestrel_common::Mac;
use tracing::{debug, trace};

use crate::agent::SwitchAgent;
use crate::error::{Result, SnmpError};
use crate::types::{Neighbor, SnmpOptions, SwitchTarget};

/// lldpRemEntry
const LLDP_REM_ENTRY: &str = ".1.0.8802.1.1.2.1.4.1.1";
/// lldpRemManAddrIfSubtype, indexed by the management address itself
const LLDP_REM_MAN_ADDR_IF_SUBTYPE: &str = ".1.0.8802.1.1.2.1.4.2.1.3";
/// pethPsePortAdminEnable, suffixed with `.<group>.<port>`
const PETH_PSE_PORT_ADMIN_ENABLE: &str = ".1.3.6.1.2.1.105.1.1.1.3";
const PSE_GROUP: u32 = 1;

const COL_CHASSIS_ID: u32 = 5;
const COL_PORT_ID: u32 = 7;
const COL_SYS_NAME: u32 = 9;
const COL_SYS_CAP_ENABLED: u32 = 12;

/// Switch agent backed by the net-snmp tools
#[derive(Debug, Clone)]
pub struct NetSnmpAgent {
    options: SnmpOptions,
}

impl NetSnmpAgent {
    pub fn new(options: SnmpOptions) -> Self {
        Self { options }
    }

    fn base_args(&self, host: Ipv4Addr) -> Vec<String> {
        vec![
            "-v".to_string(),
            self.options.version.as_arg().to_string(),
            "-c".to_string(),
            self.options.community.clone(),
            "-r".to_string(),
            self.options.retries.to_string(),
            "-t".to_string(),
            self.options.timeout_secs.to_string(),
            "-On".to_string(),
            "-Oq".to_string(),
            "-Oe".to_string(),
            host.to_string(),
        ]
    }

    fn run(&self, tool: &str, host: Ipv4Addr, extra: &[&str]) -> Result<String> {
        let mut args = self.base_args(host);
        args.extend(extra.iter().map(|s| s.to_string()));
        trace!(tool, args = ?args, "running net-snmp tool");

        let output = Command::new(tool).args(&args).output().map_err(|e| SnmpError::Spawn {
            tool: tool.to_string(),
            source: e,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(host, &stderr));
        }
        if stdout.contains("No Such Object") || stdout.contains("No Such Instance") {
            return Err(SnmpError::Unsupported(host, extra.join(" ")));
        }
        Ok(stdout)
    }

    fn port_oid(port: u32) -> String {
        format!("{}.{}.{}", PETH_PSE_PORT_ADMIN_ENABLE, PSE_GROUP, port)
    }
}

impl SwitchAgent for NetSnmpAgent {
    fn neighbors(&self, switch: &SwitchTarget) -> Result<Vec<Neighbor>> {
        let table = self.run("snmpwalk", switch.ip, &[LLDP_REM_ENTRY])?;
        // The management address table is optional in LLDP-MIB
        let addresses = match self.run("snmpwalk", switch.ip, &[LLDP_REM_MAN_ADDR_IF_SUBTYPE]) {
            Ok(out) => out,
            Err(SnmpError::Unsupported(..)) => String::new(),
            Err(e) => return Err(e),
        };
        let neighbors = parse_lldp_neighbors(&table, &addresses)?;
        debug!(switch = %switch.ip, count = neighbors.len(), "LLDP table read");
        Ok(neighbors)
    }

    fn set_port_power(&self, switch: &SwitchTarget, port: u32, on: bool) -> Result<bool> {
        let value = if on { "1" } else { "2" };
        let oid = Self::port_oid(port);
        self.run("snmpset", switch.ip, &[&oid, "i", value])?;
        Ok(true)
    }

    fn port_power(&self, switch: &SwitchTarget, port: u32) -> Result<Option<bool>> {
        let oid = Self::port_oid(port);
        let out = self.run("snmpget", switch.ip, &[&oid])?;
        let rows = parse_walk(&out);
        Ok(rows.first().and_then(|(_, value)| parse_truth_value(value)))
    }
}

fn classify_failure(host: Ipv4Addr, stderr: &str) -> SnmpError {
    let msg = stderr.trim().to_string();
    if msg.contains("Timeout") {
        SnmpError::Timeout(host)
    } else if msg.contains("Unknown host") || msg.contains("unreachable") {
        SnmpError::Unreachable(host, msg)
    } else {
        SnmpError::CommandFailed(msg)
    }
}

/// Split `snmpwalk -On -Oq` output into (oid components, raw value).
///
/// Long hex strings wrap onto continuation lines; they are folded back into
/// the previous value.
fn parse_walk(output: &str) -> Vec<(Vec<u32>, String)> {
    let mut rows: Vec<(Vec<u32>, String)> = Vec::new();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('.') {
            if let Some((_, value)) = rows.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        let (oid, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let components: Option<Vec<u32>> = oid
            .trim_start_matches('.')
            .split('.')
            .map(|c| c.parse().ok())
            .collect();
        if let Some(components) = components {
            rows.push((components, value.trim().to_string()));
        }
    }
    rows
}

fn oid_components(oid: &str) -> Vec<u32> {
    oid.trim_start_matches('.')
        .split('.')
        .filter_map(|c| c.parse().ok())
        .collect()
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim()
}

/// Chassis ids come back either as a MAC string or as space separated hex
fn parse_chassis_id(value: &str) -> Option<Mac> {
    let raw = unquote(value);
    if let Ok(mac) = raw.parse::<Mac>() {
        return Some(mac);
    }
    let bytes: Vec<u8> = raw
        .split_whitespace()
        .map(|b| u8::from_str_radix(b, 16))
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let octets: [u8; 6] = bytes.try_into().ok()?;
    Some(Mac::new(octets))
}

fn parse_port_id(value: &str) -> Option<u32> {
    let raw = unquote(value);
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse().ok()
    } else {
        None
    }
}

/// LLDP system capabilities is a BITS value; bridge is bit 2
fn parse_bridge_capability(value: &str) -> bool {
    if value.contains("bridge(") {
        return true;
    }
    unquote(value)
        .split_whitespace()
        .next()
        .and_then(|b| u8::from_str_radix(b, 16).ok())
        .map(|b| b & 0x20 != 0)
        .unwrap_or(false)
}

/// TruthValue: true(1), false(2)
fn parse_truth_value(value: &str) -> Option<bool> {
    match unquote(value) {
        "1" | "true(1)" | "true" => Some(true),
        "2" | "false(2)" | "false" => Some(false),
        _ => None,
    }
}

#[derive(Default)]
struct RemoteRow {
    chassis: Option<Mac>,
    port: Option<u32>,
    name: Option<String>,
    bridge: bool,
}

/// Build neighbor entries from the lldpRemTable and lldpRemManAddrTable walks.
///
/// Rows are indexed by `timeMark.localPort.remIndex`; results are ordered by
/// local port then remote index. Rows without a usable chassis id are
/// dropped.
fn parse_lldp_neighbors(table: &str, addresses: &str) -> Result<Vec<Neighbor>> {
    let base = oid_components(LLDP_REM_ENTRY);
    let mut rows: BTreeMap<(u32, u32), RemoteRow> = BTreeMap::new();

    for (oid, value) in parse_walk(table) {
        if !oid.starts_with(&base) || oid.len() != base.len() + 4 {
            continue;
        }
        let column = oid[base.len()];
        let key = (oid[base.len() + 2], oid[base.len() + 3]);
        let row = rows.entry(key).or_default();
        match column {
            COL_CHASSIS_ID => row.chassis = parse_chassis_id(&value),
            COL_PORT_ID => row.port = parse_port_id(&value),
            COL_SYS_NAME => {
                let name = unquote(&value);
                if !name.is_empty() {
                    row.name = Some(name.to_string());
                }
            }
            COL_SYS_CAP_ENABLED => row.bridge = parse_bridge_capability(&value),
            _ => {}
        }
    }

    let addr_base = oid_components(LLDP_REM_MAN_ADDR_IF_SUBTYPE);
    let mut ips: BTreeMap<(u32, u32), Ipv4Addr> = BTreeMap::new();
    for (oid, _) in parse_walk(addresses) {
        // timeMark.localPort.remIndex.addrSubtype.addrLen.a.b.c.d
        let suffix = match oid.strip_prefix(addr_base.as_slice()) {
            Some(s) => s,
            None => continue,
        };
        if suffix.len() == 9 && suffix[3] == 1 && suffix[4] == 4 {
            let octets: Vec<u8> = suffix[5..].iter().filter_map(|o| u8::try_from(*o).ok()).collect();
            if let [a, b, c, d] = octets.as_slice() {
                ips.entry((suffix[1], suffix[2]))
                    .or_insert(Ipv4Addr::new(*a, *b, *c, *d));
            }
        }
    }

    if rows.is_empty() && !table.trim().is_empty() && parse_walk(table).is_empty() {
        return Err(SnmpError::Parse(table.lines().next().unwrap_or_default().to_string()));
    }

    Ok(rows
        .into_iter()
        .filter_map(|(key, row)| {
            let chassis = row.chassis?;
            Some(Neighbor {
                local_port: key.0,
                remote_mac: chassis,
                remote_port: row.port,
                remote_name: row.name,
                remote_ip: ips.get(&key).copied(),
                bridge: row.bridge,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
.1.0.8802.1.1.2.1.4.1.1.5.0.3.1 00 11 22 33 44 55
.1.0.8802.1.1.2.1.4.1.1.5.0.7.2 \"b8:27:eb:00:00:01\"
.1.0.8802.1.1.2.1.4.1.1.7.0.3.1 \"24\"
.1.0.8802.1.1.2.1.4.1.1.7.0.7.2 \"eth0\"
.1.0.8802.1.1.2.1.4.1.1.9.0.3.1 \"core-switch\"
.1.0.8802.1.1.2.1.4.1.1.9.0.7.2 \"rpi-7\"
.1.0.8802.1.1.2.1.4.1.1.12.0.3.1 28 00
.1.0.8802.1.1.2.1.4.1.1.12.0.7.2 80 00
";

    const ADDRESSES: &str = "\
.1.0.8802.1.1.2.1.4.2.1.3.0.3.1.1.4.192.168.152.2 2
";

    #[test]
    fn test_parse_lldp_neighbors() {
        let neighbors = parse_lldp_neighbors(TABLE, ADDRESSES).unwrap();
        assert_eq!(neighbors.len(), 2);

        let sw = &neighbors[0];
        assert_eq!(sw.local_port, 3);
        assert_eq!(sw.remote_mac.to_string(), "00:11:22:33:44:55");
        assert_eq!(sw.remote_port, Some(24));
        assert_eq!(sw.remote_name.as_deref(), Some("core-switch"));
        assert_eq!(sw.remote_ip, Some(Ipv4Addr::new(192, 168, 152, 2)));
        assert!(sw.bridge);

        let node = &neighbors[1];
        assert_eq!(node.local_port, 7);
        assert_eq!(node.remote_mac.to_string(), "b8:27:eb:00:00:01");
        assert_eq!(node.remote_port, None);
        assert_eq!(node.remote_ip, None);
        assert!(!node.bridge);
    }

    #[test]
    fn test_parse_walk_continuation() {
        let out = ".1.2.3 00 11 22\n33 44 55\n.1.2.4 \"x\"\n";
        let rows = parse_walk(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, vec![1, 2, 3]);
        assert_eq!(rows[0].1, "00 11 22 33 44 55");
        assert_eq!(parse_chassis_id(&rows[0].1).unwrap().to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_empty_table() {
        assert!(parse_lldp_neighbors("", "").unwrap().is_empty());
    }

    #[test]
    fn test_truth_value() {
        assert_eq!(parse_truth_value("1"), Some(true));
        assert_eq!(parse_truth_value("false(2)"), Some(false));
        assert_eq!(parse_truth_value("3"), None);
    }

    #[test]
    fn test_bridge_capability() {
        assert!(parse_bridge_capability("\"bridge(2) router(4)\""));
        assert!(parse_bridge_capability("20 00"));
        assert!(!parse_bridge_capability("80 00"));
        assert!(!parse_bridge_capability(""));
    }

    #[test]
    fn test_classify_failure() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(
            classify_failure(ip, "Timeout: No Response from 10.0.0.1"),
            SnmpError::Timeout(_)
        ));
        assert!(matches!(
            classify_failure(ip, "snmpset: Unknown host (10.0.0.1)"),
            SnmpError::Unreachable(..)
        ));
        assert!(matches!(
            classify_failure(ip, "Error in packet: notWritable"),
            SnmpError::CommandFailed(_)
        ));
    }

    #[test]
    fn test_base_args() {
        let agent = NetSnmpAgent::new(SnmpOptions::default());
        let args = agent.base_args(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(&args[..4], &["-v", "2c", "-c", "private"]);
        assert_eq!(args.last().unwrap(), "10.0.0.1");
        assert_eq!(
            NetSnmpAgent::port_oid(5),
            ".1.3.6.1.2.1.105.1.1.1.3.1.5"
        );
    }
}
