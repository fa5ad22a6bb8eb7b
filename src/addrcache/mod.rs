//! Longest-prefix-match address cache.
//!
//! Values are indexed by an exact `(address, prefix length)` pair. IPv4 and
//! IPv6 entries live in separate tables, one hash map per prefix length,
//! keyed by the masked network address of the block
//! ([`IpNetwork::network`]):
//!
//! ```text
//! v4: [/0 map, /1 map, ..., /32 map]    key = 4-byte network address
//! v6: [/0 map, /1 map, ..., /128 map]   key = 16-byte network address
//! ```
//!
//! A longest-prefix lookup ([`AddressCache::run_ip`]) walks the tables from
//! the most specific length down to `/0`. That is at most 33 (IPv4) or 129
//! (IPv6) map lookups, which is fine for policy resolution where rule sets
//! are small and lookups are off the per-packet path.
//!
//! # Example
//!
//! ```
//! use pu_enforcer::addrcache::AddressCache;
//! use std::net::IpAddr;
//!
//! let cache = AddressCache::new();
//! cache.put("10.0.0.0".parse().unwrap(), 8, "A").unwrap();
//! cache.put("10.1.0.0".parse().unwrap(), 16, "B").unwrap();
//!
//! let mut hit = None;
//! cache.run_ip("10.1.2.3".parse::<IpAddr>().unwrap(), |v| {
//!     hit = Some(*v);
//!     true
//! });
//! assert_eq!(hit, Some("B"));
//! ```

mod error;

pub use error::AddrCacheError;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

const V4_BITS: u8 = 32;
const V6_BITS: u8 = 128;

/// One map per prefix length, keyed by the masked network address.
struct Tables<V> {
    v4: Vec<HashMap<IpAddr, V>>,
    v6: Vec<HashMap<IpAddr, V>>,
}

impl<V> Tables<V> {
    fn family(&self, ip: IpAddr) -> &[HashMap<IpAddr, V>] {
        match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    fn table(&self, network: &IpNetwork) -> &HashMap<IpAddr, V> {
        &self.family(network.ip())[network.prefix() as usize]
    }

    fn table_mut(&mut self, network: &IpNetwork) -> &mut HashMap<IpAddr, V> {
        let len = network.prefix() as usize;
        match network {
            IpNetwork::V4(_) => &mut self.v4[len],
            IpNetwork::V6(_) => &mut self.v6[len],
        }
    }
}

/// Concurrent longest-prefix-match store, generic over the stored value.
///
/// Writers (policy installation) are rare relative to readers (rule
/// evaluation), so the tables sit behind a single reader-writer lock.
pub struct AddressCache<V> {
    tables: RwLock<Tables<V>>,
}

impl<V> AddressCache<V> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                v4: (0..=V4_BITS).map(|_| HashMap::new()).collect(),
                v6: (0..=V6_BITS).map(|_| HashMap::new()).collect(),
            }),
        }
    }

    /// Store `value` under the exact `(ip, prefix_len)` pair.
    ///
    /// Host bits of `ip` beyond the prefix are ignored, so `10.1.2.3/8` and
    /// `10.0.0.0/8` name the same entry.
    pub fn put(&self, ip: IpAddr, prefix_len: u8, value: V) -> Result<(), AddrCacheError> {
        self.insert(IpNetwork::new(ip, prefix_len)?, value);
        Ok(())
    }

    /// Store `value` under `network`, returning the value it replaced.
    pub fn insert(&self, network: IpNetwork, value: V) -> Option<V> {
        self.tables
            .write()
            .table_mut(&network)
            .insert(network.network(), value)
    }

    /// Modify the value stored under `network` in place, starting from
    /// `V::default()` when there is none. The whole update holds the write
    /// lock.
    pub fn update<F>(&self, network: IpNetwork, modify: F)
    where
        V: Default,
        F: FnOnce(&mut V),
    {
        let mut tables = self.tables.write();
        modify(
            tables
                .table_mut(&network)
                .entry(network.network())
                .or_default(),
        );
    }

    /// Exact-length lookup. Returns `Ok(None)` when nothing is stored.
    pub fn get(&self, ip: IpAddr, prefix_len: u8) -> Result<Option<V>, AddrCacheError>
    where
        V: Clone,
    {
        let network = IpNetwork::new(ip, prefix_len)?;
        let tables = self.tables.read();
        Ok(tables.table(&network).get(&network.network()).cloned())
    }

    /// Remove the entry stored under `(ip, prefix_len)`, returning it.
    pub fn delete(&self, ip: IpAddr, prefix_len: u8) -> Result<Option<V>, AddrCacheError> {
        let network = IpNetwork::new(ip, prefix_len)?;
        Ok(self
            .tables
            .write()
            .table_mut(&network)
            .remove(&network.network()))
    }

    /// Longest-prefix walk.
    ///
    /// Visits every stored entry covering `ip`, most specific first, and
    /// stops at the first one for which `visit` returns `true`. Returns
    /// whether a visitor accepted an entry. The cache is not modified.
    ///
    /// `visit` runs under the read lock and must not call back into this
    /// cache: a queued writer would block the nested read forever.
    pub fn run_ip<F>(&self, ip: IpAddr, mut visit: F) -> bool
    where
        F: FnMut(&V) -> bool,
    {
        let tables = self.tables.read();
        let family = tables.family(ip);
        for len in (0..family.len()).rev() {
            let table = &family[len];
            if table.is_empty() {
                continue;
            }
            let Ok(network) = IpNetwork::new(ip, len as u8) else {
                continue;
            };
            if let Some(value) = table.get(&network.network())
                && visit(value)
            {
                return true;
            }
        }
        false
    }

    /// Apply `transform` to every stored value.
    ///
    /// A `Some` result replaces the value, `None` deletes the entry. Used
    /// for bulk refresh or invalidation after a policy update.
    pub fn run_val<F>(&self, mut transform: F)
    where
        F: FnMut(&V) -> Option<V>,
    {
        let mut tables = self.tables.write();
        let Tables { v4, v6 } = &mut *tables;
        for table in v4.iter_mut().chain(v6.iter_mut()) {
            table.retain(|_, value| match transform(value) {
                Some(next) => {
                    *value = next;
                    true
                }
                None => false,
            });
        }
    }

    /// Total number of stored entries across both families.
    pub fn len(&self) -> usize {
        let tables = self.tables.read();
        tables
            .v4
            .iter()
            .chain(tables.v6.iter())
            .map(HashMap::len)
            .sum()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for AddressCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for AddressCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressCache")
            .field("entries", &self.len())
            .finish()
    }
}
