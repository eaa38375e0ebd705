use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

use ipnet::Ipv4Net;
use thiserror::Error;

use super::nets_overlap;

/// Host subnet length assumed for entries written without one.
pub const DEFAULT_HOST_PREFIX_LEN: u8 = 24;
/// Anything narrower than a /30 leaves no room for endpoints.
pub const MAX_HOST_PREFIX_LEN: u8 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("cluster-cidr '{}' is not formatted properly!", .0)]
    Malformed(String),
    #[error("'{}' is not a valid IPv4 CIDR!", .0)]
    InvalidCidr(String),
    #[error("Host subnet length {} is invalid for {}!", .1, .0)]
    InvalidHostPrefix(Ipv4Net, u8),
    #[error("CIDR {} overlaps with another cluster network CIDR!", .0)]
    Overlapping(Ipv4Net),
    #[error("At least one cluster network CIDR must be given!")]
    Empty,
}

/// One `CIDR/host-prefix-length` pair of the cluster network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterCidrEntry {
    pub cidr: Ipv4Net,
    pub host_prefix_len: u8,
}

impl ClusterCidrEntry {
    pub fn new(cidr: Ipv4Net, host_prefix_len: u8) -> Result<Self, CidrError> {
        let cidr = cidr.trunc();

        if host_prefix_len < cidr.prefix_len() || host_prefix_len > MAX_HOST_PREFIX_LEN {
            return Err(CidrError::InvalidHostPrefix(cidr, host_prefix_len));
        }

        Ok(Self {
            cidr,
            host_prefix_len,
        })
    }

    /// Number of host subnets this entry can be carved into.
    pub fn slot_count(&self) -> u32 {
        1 << (self.host_prefix_len - self.cidr.prefix_len())
    }

    pub fn slot_size(&self) -> u32 {
        1 << (32 - self.host_prefix_len)
    }

    pub fn subnet_at(&self, slot: u32) -> Option<Ipv4Net> {
        if slot >= self.slot_count() {
            return None;
        }

        let network = u32::from(self.cidr.network()) + slot * self.slot_size();

        Ipv4Net::new(Ipv4Addr::from(network), self.host_prefix_len).ok()
    }

    /// Slot index of `subnet` if it is exactly one of this entry's host subnets.
    pub fn slot_of(&self, subnet: &Ipv4Net) -> Option<u32> {
        if subnet.prefix_len() != self.host_prefix_len
            || subnet.network() != subnet.addr()
            || !self.cidr.contains(&subnet.network())
        {
            return None;
        }

        Some((u32::from(subnet.network()) - u32::from(self.cidr.network())) >> (32 - self.host_prefix_len))
    }
}

impl Display for ClusterCidrEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cidr, self.host_prefix_len)
    }
}

impl FromStr for ClusterCidrEntry {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s.split('/').collect::<Vec<_>>();
        let (cidr, host_prefix_len) = match split.as_slice() {
            [address, prefix, host_prefix] => (
                format!("{address}/{prefix}"),
                host_prefix
                    .parse::<u8>()
                    .map_err(|_| CidrError::Malformed(s.to_owned()))?,
            ),
            [address, prefix] => (format!("{address}/{prefix}"), DEFAULT_HOST_PREFIX_LEN),
            _ => return Err(CidrError::Malformed(s.to_owned())),
        };

        let cidr = cidr
            .parse::<Ipv4Net>()
            .map_err(|_| CidrError::InvalidCidr(cidr.clone()))?;

        Self::new(cidr, host_prefix_len)
    }
}

/// Ordered, non-overlapping list of cluster network entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCidr(Vec<ClusterCidrEntry>);

impl ClusterCidr {
    pub fn new(entries: Vec<ClusterCidrEntry>) -> Result<Self, CidrError> {
        if entries.is_empty() {
            return Err(CidrError::Empty);
        }

        for (index, entry) in entries.iter().enumerate() {
            if entries[..index]
                .iter()
                .any(|previous| nets_overlap(&previous.cidr, &entry.cidr))
            {
                return Err(CidrError::Overlapping(entry.cidr));
            }
        }

        Ok(Self(entries))
    }

    pub fn entries(&self) -> &[ClusterCidrEntry] {
        &self.0
    }

    pub fn nets(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.0.iter().map(|entry| entry.cidr)
    }

    pub fn contains(&self, address: &Ipv4Addr) -> bool {
        self.0.iter().any(|entry| entry.cidr.contains(address))
    }

    pub fn overlaps(&self, net: &Ipv4Net) -> bool {
        self.0.iter().any(|entry| nets_overlap(&entry.cidr, net))
    }

    /// Total number of host subnets across every entry.
    pub fn slot_count(&self) -> u64 {
        self.0.iter().map(|entry| u64::from(entry.slot_count())).sum()
    }
}

impl Display for ClusterCidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|entry| entry.to_string())
            .collect::<Vec<_>>()
            .join(",");

        f.write_str(&joined)
    }
}

impl FromStr for ClusterCidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let entries = s
            .split(',')
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| raw.parse())
            .collect::<Result<Vec<ClusterCidrEntry>, _>>()?;

        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use ipnet::Ipv4Net;

    use super::{CidrError, ClusterCidr, ClusterCidrEntry};

    #[test]
    fn parses_entries_with_and_without_host_length() {
        let cidr: ClusterCidr = "10.128.0.0/14/23,10.0.0.0/16".parse().unwrap();
        let entries = cidr.entries();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host_prefix_len, 23);
        assert_eq!(entries[0].slot_count(), 512);
        assert_eq!(entries[1].host_prefix_len, 24);
        assert_eq!(cidr.to_string(), "10.128.0.0/14/23,10.0.0.0/16/24");
        assert_eq!(cidr.slot_count(), 768);
    }

    #[test]
    fn rejects_overlapping_entries() {
        let result = "10.0.0.0/16/24,10.0.128.0/17/24".parse::<ClusterCidr>();

        assert_eq!(
            result,
            Err(CidrError::Overlapping("10.0.128.0/17".parse().unwrap()))
        );
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            "10.0.0.0".parse::<ClusterCidrEntry>(),
            Err(CidrError::Malformed(_))
        ));
        assert!(matches!(
            "10.0.0.0/16/x".parse::<ClusterCidrEntry>(),
            Err(CidrError::Malformed(_))
        ));
        assert!(matches!(
            "10.0.0.0/16/8".parse::<ClusterCidrEntry>(),
            Err(CidrError::InvalidHostPrefix(_, 8))
        ));
        assert!(matches!(
            "10.0.0.0/16/31".parse::<ClusterCidrEntry>(),
            Err(CidrError::InvalidHostPrefix(_, 31))
        ));
        assert!(matches!(
            "fd00::/64/96".parse::<ClusterCidrEntry>(),
            Err(CidrError::InvalidCidr(_))
        ));
        assert_eq!("".parse::<ClusterCidr>(), Err(CidrError::Empty));
    }

    #[test]
    fn single_slot_entry_is_allowed() {
        let entry: ClusterCidrEntry = "10.0.0.0/30/30".parse().unwrap();

        assert_eq!(entry.slot_count(), 1);
        assert_eq!(entry.subnet_at(0), Some("10.0.0.0/30".parse().unwrap()));
        assert_eq!(entry.subnet_at(1), None);
    }

    #[test]
    fn slot_lookup_matches_subnet_at() {
        let entry: ClusterCidrEntry = "10.0.0.0/16/24".parse().unwrap();
        let subnet: Ipv4Net = "10.0.9.0/24".parse().unwrap();

        assert_eq!(entry.slot_of(&subnet), Some(9));
        assert_eq!(entry.subnet_at(9), Some(subnet));
        assert_eq!(entry.slot_of(&"10.0.9.0/25".parse().unwrap()), None);
        assert_eq!(entry.slot_of(&"10.0.9.4/24".parse().unwrap()), None);
        assert_eq!(entry.slot_of(&"10.1.9.0/24".parse().unwrap()), None);
    }
}
