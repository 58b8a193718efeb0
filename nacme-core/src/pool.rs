//! Address pool arithmetic.
//!
//! A pool is a CIDR block. Addresses are addressed by their offset from the
//! network address. Usable offsets run from `1` to `total - 2` inclusive, so
//! the network address and the last address of the block (the IPv4
//! broadcast address) are never handed out automatically.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Errors raised while parsing a pool or validating an address against it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The CIDR string could not be parsed.
    #[error("invalid CIDR {input:?}: {reason}")]
    InvalidCidr { input: String, reason: &'static str },

    /// The address is outside the pool.
    #[error("IP {ip} is not in subnet {pool}")]
    OutsidePool { ip: IpAddr, pool: AddressPool },

    /// The address is the pool's network address.
    #[error("IP {0} is the network address and cannot be assigned")]
    NetworkAddress(IpAddr),

    /// The address is the pool's IPv4 broadcast address.
    #[error("IP {0} is the broadcast address and cannot be assigned")]
    BroadcastAddress(IpAddr),

    /// The pool has no assignable addresses at all.
    #[error("network {0} has no usable addresses")]
    NoUsableAddresses(AddressPool),
}

/// A CIDR block that host addresses are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPool {
    network: IpAddr,
    prefix_len: u8,
}

impl AddressPool {
    /// Parse a CIDR such as `10.200.0.0/24`.
    ///
    /// Host bits are masked off, so `10.200.0.7/24` yields `10.200.0.0/24`.
    /// A bare address is treated as a full-length prefix.
    pub fn parse(input: &str) -> Result<Self, PoolError> {
        let invalid = |reason| PoolError::InvalidCidr {
            input: input.to_string(),
            reason,
        };

        let trimmed = input.trim();
        let (addr_part, prefix_part) = match trimmed.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (trimmed, None),
        };

        let addr: IpAddr = addr_part.parse().map_err(|_| invalid("bad address"))?;
        let max = max_prefix(&addr);
        let prefix_len = match prefix_part {
            Some(p) => p.parse::<u8>().map_err(|_| invalid("bad prefix length"))?,
            None => max,
        };
        if prefix_len > max {
            return Err(invalid("prefix length out of range"));
        }

        let host_bits = u32::from(max - prefix_len);
        let mask = if host_bits >= 128 {
            0
        } else {
            !((1u128 << host_bits) - 1)
        };
        let network = from_bits(&addr, to_bits(&addr) & mask);

        Ok(Self {
            network,
            prefix_len,
        })
    }

    /// The network (first) address of the block.
    pub fn network(&self) -> IpAddr {
        self.network
    }

    /// Prefix length in bits.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    fn host_bits(&self) -> u32 {
        u32::from(max_prefix(&self.network) - self.prefix_len)
    }

    /// Total number of addresses in the block, saturating at `u128::MAX`.
    pub fn total_addresses(&self) -> u128 {
        let host_bits = self.host_bits();
        if host_bits >= 128 {
            u128::MAX
        } else {
            1u128 << host_bits
        }
    }

    /// Number of automatically assignable addresses.
    pub fn usable_count(&self) -> u128 {
        self.total_addresses().saturating_sub(2)
    }

    /// The last address of the block.
    pub fn last_address(&self) -> IpAddr {
        let host_bits = self.host_bits();
        let host_mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        from_bits(&self.network, to_bits(&self.network) | host_mask)
    }

    /// The IPv4 broadcast address, `None` for IPv6 pools.
    pub fn broadcast(&self) -> Option<IpAddr> {
        self.is_ipv4().then(|| self.last_address())
    }

    /// Address at `offset` from the network address.
    ///
    /// Callers pass offsets in `1..=usable_count()`; larger offsets wrap within
    /// the address family.
    pub fn address_at(&self, offset: u128) -> IpAddr {
        from_bits(&self.network, to_bits(&self.network).wrapping_add(offset))
    }

    /// Check whether `ip` belongs to this block.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if ip.is_ipv4() != self.is_ipv4() {
            return false;
        }
        let host_bits = self.host_bits();
        to_bits(ip).checked_shr(host_bits).unwrap_or(0)
            == to_bits(&self.network).checked_shr(host_bits).unwrap_or(0)
    }

    /// Validate that `ip` may be assigned to a host.
    ///
    /// Checks run in a fixed order: pool membership, network address, then
    /// (IPv4 only) broadcast address.
    pub fn validate_assignable(&self, ip: IpAddr) -> Result<IpAddr, PoolError> {
        if !self.contains(&ip) {
            return Err(PoolError::OutsidePool { ip, pool: *self });
        }
        if ip == self.network {
            return Err(PoolError::NetworkAddress(ip));
        }
        if self.broadcast() == Some(ip) {
            return Err(PoolError::BroadcastAddress(ip));
        }
        Ok(ip)
    }

    /// Fail unless the pool has at least one assignable address.
    pub fn ensure_usable(&self) -> Result<u128, PoolError> {
        match self.usable_count() {
            0 => Err(PoolError::NoUsableAddresses(*self)),
            n => Ok(n),
        }
    }
}

impl fmt::Display for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for AddressPool {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn from_bits(family: &IpAddr, bits: u128) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}
