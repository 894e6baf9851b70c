//! MariaDB GTID positions
//!
//! A position is a comma-separated list of `domain-server-sequence` triples,
//! one per replication domain, e.g. `0-1-1042,1-3-77`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DomainPosition {
    server_id: u32,
    sequence: u64,
}

/// Transaction progress of a node across all replication domains
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GtidPosition {
    domains: BTreeMap<u32, DomainPosition>,
}

impl GtidPosition {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Sequence number reached in one domain (0 if the domain is unknown)
    pub fn sequence(&self, domain: u32) -> u64 {
        self.domains.get(&domain).map(|d| d.sequence).unwrap_or(0)
    }

    /// True when every domain in `target` has been reached by `self`
    pub fn has_reached(&self, target: &GtidPosition) -> bool {
        target
            .domains
            .iter()
            .all(|(domain, pos)| self.sequence(*domain) >= pos.sequence)
    }

    /// Rank two positions by progress.
    ///
    /// Domains are compared in ascending id order; the first domain with a
    /// different sequence decides. Server ids are ignored.
    pub fn cmp_progress(&self, other: &GtidPosition) -> Ordering {
        let domains: std::collections::BTreeSet<u32> = self
            .domains
            .keys()
            .chain(other.domains.keys())
            .copied()
            .collect();
        for domain in domains {
            match self.sequence(domain).cmp(&other.sequence(domain)) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        Ordering::Equal
    }
}

impl FromStr for GtidPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut domains = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split('-').collect();
            let [domain, server_id, sequence] = parts.as_slice() else {
                return Err(Error::ConfigError(format!("malformed GTID '{}'", entry)));
            };
            let parse = |field: &str| {
                field
                    .parse::<u64>()
                    .map_err(|_| Error::ConfigError(format!("malformed GTID '{}'", entry)))
            };
            let domain = u32::try_from(parse(domain)?)
                .map_err(|_| Error::ConfigError(format!("GTID domain out of range in '{}'", entry)))?;
            let server_id = u32::try_from(parse(server_id)?)
                .map_err(|_| Error::ConfigError(format!("GTID server id out of range in '{}'", entry)))?;
            let sequence = parse(sequence)?;
            domains.insert(
                domain,
                DomainPosition {
                    server_id,
                    sequence,
                },
            );
        }
        Ok(Self { domains })
    }
}

impl fmt::Display for GtidPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .domains
            .iter()
            .map(|(domain, pos)| format!("{}-{}-{}", domain, pos.server_id, pos.sequence))
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtid(s: &str) -> GtidPosition {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_multi_domain() {
        let pos = gtid("0-1-1042, 1-3-77");
        assert_eq!(pos.sequence(0), 1042);
        assert_eq!(pos.sequence(1), 77);
        assert_eq!(pos.sequence(9), 0);
        assert_eq!(pos.to_string(), "0-1-1042,1-3-77");
    }

    #[test]
    fn test_parse_empty_position() {
        assert!(gtid("").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("0-1".parse::<GtidPosition>().is_err());
        assert!("a-b-c".parse::<GtidPosition>().is_err());
    }

    #[test]
    fn test_has_reached_requires_every_target_domain() {
        let replica = gtid("0-1-100,1-2-50");
        assert!(replica.has_reached(&gtid("0-1-100")));
        assert!(replica.has_reached(&gtid("0-1-90,1-2-50")));
        assert!(!replica.has_reached(&gtid("0-1-101")));
        assert!(!replica.has_reached(&gtid("2-1-1")));
        assert!(replica.has_reached(&GtidPosition::default()));
    }

    #[test]
    fn test_cmp_progress_ignores_server_id() {
        assert_eq!(gtid("0-1-10").cmp_progress(&gtid("0-7-10")), Ordering::Equal);
        assert_eq!(gtid("0-1-10").cmp_progress(&gtid("0-1-12")), Ordering::Less);
        assert_eq!(
            gtid("0-1-10,1-1-5").cmp_progress(&gtid("0-1-10")),
            Ordering::Greater
        );
    }
}
