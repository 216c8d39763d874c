//! MAC address type
//!
//! MAC addresses are the durable primary key of every device in the fleet,
//! so they are parsed once at the edge and carried as a fixed-size value.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet hardware address.
///
/// Displays as lowercase, colon separated (`aa:bb:cc:dd:ee:ff`). Ordering is
/// byte-wise, which keeps generated files stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mac([u8; 6]);

impl Mac {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lowercase hex without separators, e.g. `aabbccddeeff`
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Last three octets as hex, used to build provisional device names
    pub fn short_suffix(&self) -> String {
        self.0[3..].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Whether `fragment` (hex digits, optionally with `:` or `-`) is a
    /// case-insensitive suffix of this address.
    pub fn ends_with_fragment(&self, fragment: &str) -> bool {
        let wanted: String = fragment
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if wanted.is_empty() || !wanted.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }
        self.hex().ends_with(&wanted)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for Mac {
    type Err = Error;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` and `aabbccddeeff`,
    /// in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = if trimmed.contains(':') {
            trimmed.split(':').collect()
        } else if trimmed.contains('-') {
            trimmed.split('-').collect()
        } else if trimmed.len() == 12 {
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(Error::InvalidMac(s.to_string()));
        };

        if parts.len() != 6 {
            return Err(Error::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(Error::InvalidMac(s.to_string()));
            }
            octets[i] = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for Mac {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mac> for String {
    fn from(mac: Mac) -> Self {
        mac.to_string()
    }
}
