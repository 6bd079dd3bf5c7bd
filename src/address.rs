use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Number of addresses, used for sizes and free counts.
pub type Count = u32;

/// Subnets handed to the allocator must be at least this big so that the
/// network and broadcast addresses can be skipped.
pub const MIN_SUBNET_SIZE: Count = 4;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("invalid prefix length {0}")]
    InvalidPrefix(u8),
    #[error("{0} is not a network address, did you mean {1}?")]
    NotNetworkAddress(Cidr, Cidr),
    #[error("{0} is too small, at least {MIN_SUBNET_SIZE} addresses are needed")]
    TooSmall(Cidr),
    #[error("{0} ends at the top of the address space, which is not supported")]
    TooHigh(Cidr),
}

/// An IPv4 address as a plain integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u32);

impl Address {
    pub fn add(self, count: Count) -> Address {
        Address(self.0.wrapping_add(count))
    }

    pub fn sub(self, count: Count) -> Address {
        Address(self.0.wrapping_sub(count))
    }

    /// Number of addresses from `self` up to (excluding) `other`.
    pub fn distance_to(self, other: Address) -> Count {
        other.0.wrapping_sub(self.0)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address(u32::from(ip))
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Ipv4Addr::from(*self))
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map(Address::from)
            .map_err(|_| AddressError::InvalidAddress(s.to_string()))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `[start, end)` of addresses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Address,
    pub end: Address,
}

impl Range {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn with_size(start: Address, size: Count) -> Self {
        Self {
            start,
            end: start.add(size),
        }
    }

    pub fn size(&self) -> Count {
        self.start.distance_to(self.end)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &Range) -> Option<Range> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Range::new(start, end))
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{})", self.start, self.end)
    }
}

impl Debug for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Address plus prefix length, as written `10.0.0.0/24`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cidr {
    pub addr: Address,
    pub prefix_len: u8,
}

impl Cidr {
    pub fn new(addr: Address, prefix_len: u8) -> Result<Self, AddressError> {
        if prefix_len > 32 {
            return Err(AddressError::InvalidPrefix(prefix_len));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Parses a CIDR that must denote a whole subnet usable by the allocator.
    pub fn parse_subnet(s: &str) -> Result<Self, AddressError> {
        let cidr: Cidr = s.parse()?;
        cidr.validate_subnet()?;
        Ok(cidr)
    }

    pub fn validate_subnet(&self) -> Result<(), AddressError> {
        if self.prefix_len == 0 {
            return Err(AddressError::InvalidPrefix(self.prefix_len));
        }
        if self.network() != *self {
            return Err(AddressError::NotNetworkAddress(*self, self.network()));
        }
        if self.size() < MIN_SUBNET_SIZE {
            return Err(AddressError::TooSmall(*self));
        }
        if self.addr.0.checked_add(self.size()).is_none() {
            return Err(AddressError::TooHigh(*self));
        }
        Ok(())
    }

    pub fn size(&self) -> Count {
        match self.prefix_len {
            0 => Count::MAX,
            n => 1 << (32 - n as u32),
        }
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - n as u32),
        }
    }

    pub fn network(&self) -> Cidr {
        Cidr {
            addr: Address(self.addr.0 & self.mask()),
            prefix_len: self.prefix_len,
        }
    }

    /// The whole block covered by this CIDR.
    pub fn range(&self) -> Range {
        let network = self.network();
        Range::with_size(network.addr, self.size())
    }

    /// Addresses that may be handed out, excluding network and broadcast.
    pub fn host_range(&self) -> Range {
        let range = self.range();
        if range.size() < MIN_SUBNET_SIZE {
            return range;
        }
        Range::new(range.start.add(1), range.end.sub(1))
    }

    /// Same prefix length, different address (used for allocation results).
    pub fn with_addr(&self, addr: Address) -> Cidr {
        Cidr {
            addr,
            prefix_len: self.prefix_len,
        }
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Debug for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for Cidr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| AddressError::InvalidCidr(s.to_string()))?;
        let addr: Address = addr.parse()?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| AddressError::InvalidCidr(s.to_string()))?;
        Cidr::new(addr, prefix_len)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub fn ip(s: &str) -> Address {
    s.parse().unwrap()
}

#[cfg(test)]
pub fn cidr(s: &str) -> Cidr {
    s.parse().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_addresses() {
        let addr = ip("10.0.0.1");
        assert_eq!(addr, Address(0x0a000001));
        assert_eq!(addr.to_string(), "10.0.0.1");
        assert!("10.0.0".parse::<Address>().is_err());
    }

    #[test]
    fn cidr_ranges() {
        let subnet = cidr("10.0.0.0/24");
        assert_eq!(subnet.size(), 256);
        assert_eq!(subnet.range(), Range::new(ip("10.0.0.0"), ip("10.0.1.0")));
        assert_eq!(
            subnet.host_range(),
            Range::new(ip("10.0.0.1"), ip("10.0.0.255"))
        );

        let single = cidr("10.0.0.7/32");
        assert_eq!(single.host_range().size(), 1);
    }

    #[test]
    fn subnet_validation() {
        assert!(Cidr::parse_subnet("10.0.0.0/24").is_ok());
        assert!(matches!(
            Cidr::parse_subnet("10.0.0.1/24"),
            Err(AddressError::NotNetworkAddress(_, _))
        ));
        assert!(matches!(
            Cidr::parse_subnet("10.0.0.0/31"),
            Err(AddressError::TooSmall(_))
        ));
        assert!(matches!(
            Cidr::parse_subnet("255.255.255.0/24"),
            Err(AddressError::TooHigh(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Cidr>(),
            Err(AddressError::InvalidPrefix(33))
        ));
    }

    #[test]
    fn range_overlap() {
        let a = Range::new(Address(0), Address(10));
        let b = Range::new(Address(5), Address(20));
        let c = Range::new(Address(10), Address(20));

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));

        assert_eq!(a.intersect(&b), Some(Range::new(Address(5), Address(10))));
        // touching
        assert_eq!(a.intersect(&c), None);
        // disjoint
        assert_eq!(a.intersect(&Range::new(Address(30), Address(40))), None);
        // nested
        let inner = Range::new(Address(12), Address(15));
        assert_eq!(c.intersect(&inner), Some(inner));
        assert_eq!(inner.intersect(&c), Some(inner));
    }

    #[test]
    fn serde_uses_dotted_quads() {
        let range = Range::new(ip("10.0.0.0"), ip("10.0.0.128"));
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, r#"{"start":"10.0.0.0","end":"10.0.0.128"}"#);
        let back: Range = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }
}
