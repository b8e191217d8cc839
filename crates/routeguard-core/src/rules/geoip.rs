//! IP to country lookup table
//!
//! Source format, one entry per line:
//!
//! ```text
//! # comment
//! 5.0.0.0/8,RU
//! 2a02:6b8::/32,RU
//! ```

use crate::error::{Error, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

/// Longest-prefix country lookup
///
/// Networks are grouped by family and prefix length. A lookup masks the
/// address once per prefix length present, longest first, and binary
/// searches that level.
#[derive(Debug, Clone, Default)]
pub struct GeoIpTable {
    v4: FamilyTable,
    v6: FamilyTable,
}

#[derive(Debug, Clone, Default)]
struct FamilyTable {
    /// Longest prefix first; each level sorted by network address
    levels: Vec<Level>,
}

#[derive(Debug, Clone)]
struct Level {
    prefix_len: u8,
    networks: Vec<(u128, String)>,
}

impl FamilyTable {
    fn build(entries: Vec<(u128, u8, String)>) -> Self {
        let mut by_len: BTreeMap<u8, Vec<(u128, String)>> = BTreeMap::new();
        for (network, prefix_len, cc) in entries {
            by_len.entry(prefix_len).or_default().push((network, cc));
        }
        let levels = by_len
            .into_iter()
            .rev()
            .map(|(prefix_len, mut networks)| {
                // stable sort: the first listing of a duplicate network wins
                networks.sort_by_key(|(network, _)| *network);
                networks.dedup_by_key(|(network, _)| *network);
                Level { prefix_len, networks }
            })
            .collect();
        Self { levels }
    }

    fn lookup(&self, addr: u128, bits: u8) -> Option<&str> {
        self.levels.iter().find_map(|level| {
            let key = addr & mask(level.prefix_len, bits);
            level
                .networks
                .binary_search_by_key(&key, |(network, _)| *network)
                .ok()
                .map(|i| level.networks[i].1.as_str())
        })
    }

    fn len(&self) -> usize {
        self.levels.iter().map(|l| l.networks.len()).sum()
    }
}

/// Network mask of `prefix_len` leading ones within a `bits`-wide address
fn mask(prefix_len: u8, bits: u8) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    let width = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    (width << (bits - prefix_len)) & width
}

impl GeoIpTable {
    /// Create an empty table (every lookup misses)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(network, country code)` pairs
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (IpNet, String)>,
    {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for (net, cc) in entries {
            let cc = cc.to_ascii_uppercase();
            match net.trunc() {
                IpNet::V4(net) => v4.push((u128::from(u32::from(net.network())), net.prefix_len(), cc)),
                IpNet::V6(net) => v6.push((u128::from(net.network()), net.prefix_len(), cc)),
            }
        }
        Self {
            v4: FamilyTable::build(v4),
            v6: FamilyTable::build(v6),
        }
    }

    /// Parse table text; malformed lines are skipped
    ///
    /// Returns the table and the number of skipped lines.
    pub fn parse(content: &str) -> (Self, usize) {
        let mut skipped = 0;
        let mut entries = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(entry) => entries.push(entry),
                None => {
                    debug!(line = lineno + 1, "Skipping malformed GeoIP line: {}", line);
                    skipped += 1;
                }
            }
        }

        (Self::from_entries(entries), skipped)
    }

    /// Load a table from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::list_load(path.display().to_string(), e))?;
        let (table, skipped) = Self::parse(&content);
        if skipped > 0 {
            warn!(skipped, "Skipped malformed lines in {}", path.display());
        }
        info!("Loaded {} GeoIP networks from {}", table.len(), path.display());
        Ok(table)
    }

    /// Country code of the most specific network containing `ip`
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        match ip {
            IpAddr::V4(v4) => self.v4.lookup(u128::from(u32::from(v4)), 32),
            IpAddr::V6(v6) => self.v6.lookup(u128::from(v6), 128),
        }
    }

    /// Number of distinct networks
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_line(line: &str) -> Option<(IpNet, String)> {
    let (net, cc) = line.split_once(',')?;
    let net: IpNet = net.trim().parse().ok()?;
    let cc = cc.trim();
    (cc.len() == 2 && cc.bytes().all(|b| b.is_ascii_alphabetic())).then(|| (net, cc.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let (table, skipped) = GeoIpTable::parse(
            "# test table\n5.0.0.0/8,RU\n\n8.8.8.0/24,us\nnot-a-line\n2a02:6b8::/32,RU\n",
        );
        assert_eq!(table.len(), 3);
        assert_eq!(skipped, 1);
        assert_eq!(table.lookup("5.6.7.8".parse().unwrap()), Some("RU"));
        assert_eq!(table.lookup("8.8.8.8".parse().unwrap()), Some("US"));
        assert_eq!(table.lookup("2a02:6b8::1".parse().unwrap()), Some("RU"));
        assert_eq!(table.lookup("1.1.1.1".parse().unwrap()), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let (table, _) = GeoIpTable::parse("10.0.0.0/8,AA\n10.1.0.0/16,BB\n");
        assert_eq!(table.lookup("10.1.2.3".parse().unwrap()), Some("BB"));
        assert_eq!(table.lookup("10.2.0.1".parse().unwrap()), Some("AA"));
    }

    #[test]
    fn test_nested_and_adjacent_networks() {
        let (table, _) = GeoIpTable::parse(
            "0.0.0.0/0,ZZ\n10.0.0.0/8,AA\n10.1.0.0/16,BB\n10.1.2.0/24,CC\n11.0.0.0/8,DD\n\
             2001:db8::/32,EE\n2001:db8:1::/48,FF\n",
        );
        assert_eq!(table.len(), 7);
        assert_eq!(table.lookup("10.1.2.200".parse().unwrap()), Some("CC"));
        assert_eq!(table.lookup("10.1.3.1".parse().unwrap()), Some("BB"));
        assert_eq!(table.lookup("10.255.0.1".parse().unwrap()), Some("AA"));
        assert_eq!(table.lookup("11.0.0.1".parse().unwrap()), Some("DD"));
        assert_eq!(table.lookup("192.0.2.1".parse().unwrap()), Some("ZZ"));
        assert_eq!(table.lookup("2001:db8:1::5".parse().unwrap()), Some("FF"));
        assert_eq!(table.lookup("2001:db8:2::5".parse().unwrap()), Some("EE"));
        // the v4 default route does not cover v6
        assert_eq!(table.lookup("2001:db9::1".parse().unwrap()), None);
    }

    #[test]
    fn test_host_bits_and_duplicates() {
        let (table, _) = GeoIpTable::parse("10.1.2.3/16,AA\n10.1.0.0/16,BB\n::1/128,LO\n");
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("10.1.99.1".parse().unwrap()), Some("AA"));
        assert_eq!(table.lookup("::1".parse().unwrap()), Some("LO"));
        assert_eq!(table.lookup("::2".parse().unwrap()), None);
    }

    #[test]
    fn test_large_table_lookup() {
        let entries = (0..=255u8).flat_map(|a| {
            (0..=255u8).map(move |b| {
                let net: IpNet = format!("{a}.{b}.0.0/16").parse().unwrap();
                (net, if b % 2 == 0 { "EV".to_string() } else { "OD".to_string() })
            })
        });
        let table = GeoIpTable::from_entries(entries);
        assert_eq!(table.len(), 65_536);
        assert_eq!(table.lookup("200.41.7.7".parse().unwrap()), Some("OD"));
        assert_eq!(table.lookup("3.8.0.1".parse().unwrap()), Some("EV"));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geoip.csv");
        std::fs::write(&path, "5.0.0.0/8,RU\n").unwrap();

        let table = GeoIpTable::load(&path).unwrap();
        assert_eq!(table.len(), 1);

        assert!(GeoIpTable::load(dir.path().join("missing.csv")).is_err());
    }
}
