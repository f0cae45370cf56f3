//! Address admission policy: IP-family preference, CIDR denylist, port
//! sanity. Shared by the KRPC transport (inbound/outbound datagrams) and the
//! manager (announce observations).

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpFamily {
    V4Only,
    V6Only,
    #[default]
    Both,
}

impl IpFamily {
    pub fn permits(&self, ip: IpAddr) -> bool {
        match self {
            IpFamily::V4Only => ip.is_ipv4(),
            IpFamily::V6Only => ip.is_ipv6(),
            IpFamily::Both => true,
        }
    }
}

impl FromStr for IpFamily {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v4" | "v4only" | "ipv4" | "4" => Ok(IpFamily::V4Only),
            "v6" | "v6only" | "ipv6" | "6" => Ok(IpFamily::V6Only),
            "both" | "dual" | "" => Ok(IpFamily::Both),
            other => Err(PolicyError::BadFamily(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("invalid ip family: {0:?}")]
    BadFamily(String),
    #[error("invalid cidr: {0:?}")]
    BadCidr(String),
}

/// One forbidden subnet, stored as an inclusive masked integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subnet {
    V4 { start: u32, end: u32 },
    V6 { start: u128, end: u128 },
}

impl Subnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Subnet::V4 { start, end }, IpAddr::V4(ip)) => {
                let value = u32::from(ip);
                value >= *start && value <= *end
            }
            (Subnet::V6 { start, end }, IpAddr::V6(ip)) => {
                let value = u128::from(ip);
                value >= *start && value <= *end
            }
            _ => false,
        }
    }
}

impl FromStr for Subnet {
    type Err = PolicyError;

    /// Accepts `a.b.c.d/len`, a v6 CIDR, or a bare address (a /32 or /128).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PolicyError::BadCidr(s.to_string());
        let (base, prefix) = match s.split_once('/') {
            Some((base, prefix)) => {
                let prefix = prefix.trim().parse::<u8>().map_err(|_| bad())?;
                (base.trim(), Some(prefix))
            }
            None => (s.trim(), None),
        };
        match IpAddr::from_str(base).map_err(|_| bad())? {
            IpAddr::V4(ip) => {
                let prefix = prefix.unwrap_or(32);
                if prefix > 32 {
                    return Err(bad());
                }
                let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
                let start = u32::from(ip) & mask;
                Ok(Subnet::V4 {
                    start,
                    end: start | !mask,
                })
            }
            IpAddr::V6(ip) => {
                let prefix = prefix.unwrap_or(128);
                if prefix > 128 {
                    return Err(bad());
                }
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - prefix)
                };
                let start = u128::from(ip) & mask;
                Ok(Subnet::V6 {
                    start,
                    end: start | !mask,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddrPolicy {
    family: IpFamily,
    denylist: Vec<Subnet>,
}

impl AddrPolicy {
    pub fn new(family: IpFamily, denylist: Vec<Subnet>) -> Self {
        AddrPolicy { family, denylist }
    }

    pub fn parse(family: IpFamily, cidrs: &[String]) -> Result<Self, PolicyError> {
        let denylist = cidrs
            .iter()
            .map(|cidr| cidr.parse())
            .collect::<Result<Vec<Subnet>, _>>()?;
        Ok(AddrPolicy { family, denylist })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Gate for DHT traffic in either direction.
    pub fn allows(&self, addr: SocketAddr) -> bool {
        if addr.port() == 0 {
            return false;
        }
        let ip = addr.ip();
        if ip.is_unspecified() {
            return false;
        }
        if !self.family.permits(ip) {
            return false;
        }
        !self.denylist.iter().any(|subnet| subnet.contains(ip))
    }

    /// Gate for announced peer addresses. Announcing a reserved port is
    /// either a broken client or a reflection attempt; drop both.
    pub fn allows_announce(&self, addr: SocketAddr) -> bool {
        self.allows(addr) && addr.port() >= 1024
    }
}
