//! Address-scoped rules for peers that are not workloads.
//!
//! External addresses cannot present identity tokens, so they are matched by
//! address block and port instead. Entries are stored in an
//! [`AddressCache`] keyed by the block; each stored value is the ordered
//! list of port ranges installed for that block. A lookup walks from the
//! most specific block to the least specific and takes the first entry
//! whose port range covers the port.

use super::error::PolicyError;
use super::rules::FlowPolicy;
use crate::addrcache::AddressCache;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// Every port.
    pub const ANY: PortRange = PortRange {
        start: 0,
        end: u16::MAX,
    };

    /// A single port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether `port` is inside the range.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl FromStr for PortRange {
    type Err = PolicyError;

    /// Accepts `"*"` or `""` (any), `"443"`, or `"8000-8100"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Self::ANY);
        }
        let invalid = || PolicyError::InvalidPorts(s.to_string());
        let range = match s.split_once('-') {
            Some((a, b)) => Self {
                start: a.trim().parse().map_err(|_| invalid())?,
                end: b.trim().parse().map_err(|_| invalid())?,
            },
            None => Self::single(s.parse().map_err(|_| invalid())?),
        };
        if range.start > range.end {
            return Err(invalid());
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One address-scoped rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclEntry {
    /// Address block.
    pub cidr: IpNetwork,
    /// Ports covered.
    pub ports: PortRange,
    /// Verdict.
    pub policy: FlowPolicy,
}

#[derive(Debug, Clone)]
struct PortRule {
    ports: PortRange,
    policy: FlowPolicy,
}

/// Longest-prefix ACL table.
#[derive(Debug, Default)]
pub struct AclCache {
    table: AddressCache<Vec<PortRule>>,
}

impl AclCache {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from entries, preserving their order per block.
    pub fn from_entries(entries: &[AclEntry]) -> Self {
        let cache = Self::new();
        for entry in entries {
            cache.add(entry);
        }
        cache
    }

    /// Append an entry to its block.
    pub fn add(&self, entry: &AclEntry) {
        self.table.update(entry.cidr, |rules| {
            rules.push(PortRule {
                ports: entry.ports,
                policy: entry.policy.clone(),
            })
        });
    }

    /// Most specific verdict for `(ip, port)`, if any entry covers it.
    pub fn lookup(&self, ip: IpAddr, port: u16) -> Option<FlowPolicy> {
        let mut found = None;
        self.table.run_ip(ip, |rules| {
            match rules.iter().find(|r| r.ports.contains(port)) {
                Some(rule) => {
                    found = Some(rule.policy.clone());
                    true
                }
                None => false,
            }
        });
        found
    }

    /// Number of address blocks with entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::Action;

    fn entry(cidr: &str, ports: &str, policy: FlowPolicy) -> AclEntry {
        AclEntry {
            cidr: cidr.parse().unwrap(),
            ports: ports.parse().unwrap(),
            policy,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_port_range_parse() {
        assert_eq!("443".parse::<PortRange>().unwrap(), PortRange::single(443));
        assert_eq!(
            "8000-8100".parse::<PortRange>().unwrap(),
            PortRange {
                start: 8000,
                end: 8100
            }
        );
        assert_eq!("*".parse::<PortRange>().unwrap(), PortRange::ANY);
        assert!("90-80".parse::<PortRange>().is_err());
        assert!("http".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_most_specific_block_wins() {
        let acls = AclCache::from_entries(&[
            entry("10.0.0.0/8", "*", FlowPolicy::accept("wide")),
            entry("10.1.0.0/16", "*", FlowPolicy::reject("narrow")),
        ]);

        let hit = acls.lookup(ip("10.1.2.3"), 443).unwrap();
        assert_eq!(hit.policy_id, "narrow");
        assert_eq!(hit.action, Action::Reject);

        assert_eq!(acls.lookup(ip("10.2.0.1"), 443).unwrap().policy_id, "wide");
        assert!(acls.lookup(ip("192.168.0.1"), 443).is_none());
    }

    #[test]
    fn test_port_miss_falls_back_to_wider_block() {
        let acls = AclCache::from_entries(&[
            entry("10.0.0.0/8", "*", FlowPolicy::reject("default")),
            entry("10.1.0.0/16", "443", FlowPolicy::accept("https")),
        ]);

        assert_eq!(acls.lookup(ip("10.1.0.9"), 443).unwrap().policy_id, "https");
        assert_eq!(acls.lookup(ip("10.1.0.9"), 22).unwrap().policy_id, "default");
    }

    #[test]
    fn test_entries_in_same_block_keep_order() {
        let acls = AclCache::from_entries(&[
            entry("10.1.0.0/16", "400-500", FlowPolicy::reject("first")),
            entry("10.1.0.0/16", "443", FlowPolicy::accept("second")),
        ]);

        assert_eq!(acls.len(), 1);
        assert_eq!(acls.lookup(ip("10.1.0.9"), 443).unwrap().policy_id, "first");
    }

    #[test]
    fn test_concurrent_adds_to_one_block_keep_every_entry() {
        let acls = std::sync::Arc::new(AclCache::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let acls = acls.clone();
                std::thread::spawn(move || {
                    for j in 0..50u16 {
                        let port = i * 100 + j;
                        acls.add(&entry("10.1.0.0/16", &port.to_string(), FlowPolicy::accept(format!("p{}", port))));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acls.len(), 1);
        for port in [0u16, 49, 349, 749] {
            let hit = acls.lookup(ip("10.1.0.1"), port).unwrap();
            assert_eq!(hit.policy_id, format!("p{}", port));
        }
    }
}
