//! Source-IP allowlist.

use std::collections::HashSet;
use std::net::{AddrParseError, IpAddr};

/// A set of permitted source addresses. Empty means every address is allowed.
///
/// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are compared as their IPv4
/// form on both sides, so a dual-stack listener sees the same decision as an
/// IPv4 one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAllowlist {
    addrs: HashSet<IpAddr>,
}

impl IpAllowlist {
    /// An allowlist that admits everyone.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        IpAllowlist {
            addrs: addrs.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    /// Parses a comma-separated address list. Blank items are ignored.
    pub fn parse(list: &str) -> Result<Self, AddrParseError> {
        let addrs = list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::parse::<IpAddr>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(addrs))
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.addrs.is_empty() || self.addrs.contains(&ip.to_canonical())
    }
}
