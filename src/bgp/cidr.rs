//! Simple CIDR block representation

// SPDX-License-Identifier: AGPL-3.0-or-later

#![allow(clippy::module_name_repetitions)]

use super::{route, Afi};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A IPv4 CIDR block
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cidr4 {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl fmt::Display for Cidr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}
impl Cidr4 {
    #[must_use]
    pub const fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

/// A IPv6 CIDR block
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Cidr6 {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
}

impl fmt::Display for Cidr6 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl Cidr6 {
    #[must_use]
    pub const fn new(addr: Ipv6Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }
}

/// A CIDR block
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "impl-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Cidr {
    V4(Cidr4),
    V6(Cidr6),
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(cidr) => write!(f, "{cidr}"),
            Self::V6(cidr) => write!(f, "{cidr}"),
        }
    }
}

impl Cidr {
    #[must_use]
    pub const fn into_parts(self) -> (IpAddr, u8) {
        match self {
            Self::V4(cidr) => (IpAddr::V4(cidr.addr), cidr.prefix_len),
            Self::V6(cidr) => (IpAddr::V6(cidr.addr), cidr.prefix_len),
        }
    }

    /// Recover the CIDR block of an NLRI entry
    ///
    /// Returns `None` if the prefix is too long for the address family.
    #[must_use]
    pub fn from_route(afi: Afi, route: &route::Value) -> Option<Self> {
        let n_octets = route::n_prefix_octets(route.prefix_len);
        if route.prefix.len() != n_octets {
            return None;
        }
        match afi {
            Afi::Ipv4 if route.prefix_len <= 32 => {
                let mut octets = [0; 4];
                octets[..n_octets].copy_from_slice(&route.prefix);
                Some(Self::V4(Cidr4::new(Ipv4Addr::from(octets), route.prefix_len)))
            }
            Afi::Ipv6 if route.prefix_len <= 128 => {
                let mut octets = [0; 16];
                octets[..n_octets].copy_from_slice(&route.prefix);
                Some(Self::V6(Cidr6::new(Ipv6Addr::from(octets), route.prefix_len)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::tests::hex_to_bytes;

    #[test]
    fn test_cidr_from_route() {
        let route = route::Value {
            path_id: Some(3),
            prefix_len: 12,
            prefix: hex_to_bytes("ac10"),
        };
        let cidr = Cidr::from_route(Afi::Ipv4, &route).unwrap();
        assert_eq!(cidr.to_string(), "172.16.0.0/12");
        assert_eq!(route::Value::from(cidr).with_path_id(Some(3)), route);
        let route6 = route::Value {
            path_id: None,
            prefix_len: 48,
            prefix: hex_to_bytes("2001 0db8 0001"),
        };
        assert_eq!(
            Cidr::from_route(Afi::Ipv6, &route6).unwrap().to_string(),
            "2001:db8:1::/48"
        );
        assert_eq!(Cidr::from_route(Afi::Ipv4, &route6), None);
    }
}
