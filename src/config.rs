//! Speaker and neighbor configuration

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::bgp::capability::AddPathMode;
use crate::bgp::Family;
use std::net::{IpAddr, Ipv4Addr};

/// BGP port
pub const BGP_PORT: u16 = 179;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(all(feature = "toml", feature = "impl-serde"))]
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error("router ID is not set")]
    NoRouterId,
    #[error("AS number of {0} is not set")]
    NoAsn(String),
    #[error("neighbor {0} is configured more than once")]
    DuplicateNeighbor(IpAddr),
    #[error("neighbor {0}: ebgp-multihop and ttl-security cannot be used together")]
    MultihopTtlSecurity(IpAddr),
    #[error("neighbor {0}: hold time {1} must be 0 or at least 3 seconds")]
    HoldTime(IpAddr, u16),
    #[error("neighbor {0}: keepalive interval {1} is longer than the hold time")]
    Keepalive(IpAddr, u16),
    #[error("neighbor {0}: address family {1} is configured more than once")]
    DuplicateFamily(IpAddr, Family),
    #[error("neighbor {0}: prefix limit threshold {1}% is above 100%")]
    PrefixThreshold(IpAddr, u8),
}

/// Whole configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Config {
    pub global: Global,
    pub neighbors: Vec<Neighbor>,
}

impl Config {
    /// Read and validate a TOML configuration file
    #[cfg(all(feature = "toml", feature = "impl-serde"))]
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill in defaults and reject conflicting settings
    pub fn validate(&mut self) -> Result<(), Error> {
        self.global.validate()?;
        let mut seen = Vec::with_capacity(self.neighbors.len());
        for neighbor in &mut self.neighbors {
            if seen.contains(&neighbor.neighbor_address) {
                return Err(Error::DuplicateNeighbor(neighbor.neighbor_address));
            }
            seen.push(neighbor.neighbor_address);
            neighbor.validate(&self.global)?;
        }
        Ok(())
    }
}

/// Settings of the speaker itself
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Global {
    #[cfg_attr(feature = "impl-serde", serde(rename = "as"))]
    pub asn: u32,
    pub router_id: Ipv4Addr,
    pub port: u16,
    pub listen_addresses: Vec<IpAddr>,
    pub confederation: Confederation,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            asn: 0,
            router_id: Ipv4Addr::UNSPECIFIED,
            port: BGP_PORT,
            listen_addresses: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            confederation: Confederation::default(),
        }
    }
}

impl Global {
    fn validate(&self) -> Result<(), Error> {
        if self.router_id.is_unspecified() {
            return Err(Error::NoRouterId);
        }
        if self.asn == 0 {
            return Err(Error::NoAsn("global".to_string()));
        }
        Ok(())
    }
}

/// BGP confederation (RFC 5065)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Confederation {
    pub enabled: bool,
    pub identifier: u32,
    pub member_as_list: Vec<u32>,
}

/// A configured peer
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Neighbor {
    pub neighbor_address: IpAddr,
    pub peer_as: u32,
    /// Defaults to the global AS
    pub local_as: u32,
    pub description: String,
    pub admin_down: bool,
    pub timers: Timers,
    pub transport: Transport,
    pub error_handling: ErrorHandling,
    pub ebgp_multihop: EbgpMultihop,
    pub ttl_security: TtlSecurity,
    pub route_reflector: RouteReflector,
    pub as_path_options: AsPathOptions,
    pub graceful_restart: GracefulRestart,
    pub afi_safis: Vec<AfiSafi>,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self {
            neighbor_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            peer_as: 0,
            local_as: 0,
            description: String::new(),
            admin_down: false,
            timers: Timers::default(),
            transport: Transport::default(),
            error_handling: ErrorHandling::default(),
            ebgp_multihop: EbgpMultihop::default(),
            ttl_security: TtlSecurity::default(),
            route_reflector: RouteReflector::default(),
            as_path_options: AsPathOptions::default(),
            graceful_restart: GracefulRestart::default(),
            afi_safis: Vec::new(),
        }
    }
}

impl Neighbor {
    /// Create a neighbor with default settings
    #[must_use]
    pub fn new(neighbor_address: IpAddr, peer_as: u32) -> Self {
        Self {
            neighbor_address,
            peer_as,
            ..Self::default()
        }
    }

    /// Fill in defaults from `global` and reject conflicting settings
    pub fn validate(&mut self, global: &Global) -> Result<(), Error> {
        let addr = self.neighbor_address;
        if self.local_as == 0 {
            self.local_as = global.asn;
        }
        if self.local_as == 0 {
            return Err(Error::NoAsn(format!("neighbor {addr} local")));
        }
        if self.peer_as == 0 {
            return Err(Error::NoAsn(format!("neighbor {addr} peer")));
        }
        if self.ebgp_multihop.enabled && self.ttl_security.enabled {
            return Err(Error::MultihopTtlSecurity(addr));
        }
        let hold_time = self.timers.hold_time;
        if hold_time == 1 || hold_time == 2 {
            return Err(Error::HoldTime(addr, hold_time));
        }
        if self.timers.keepalive_interval == 0 {
            self.timers.keepalive_interval = hold_time / 3;
        } else if self.timers.keepalive_interval > hold_time {
            return Err(Error::Keepalive(addr, self.timers.keepalive_interval));
        }
        if self.afi_safis.is_empty() {
            let family = match addr {
                IpAddr::V4(_) => Family::IPV4_UNICAST,
                IpAddr::V6(_) => Family::IPV6_UNICAST,
            };
            self.afi_safis.push(AfiSafi::new(family));
        }
        for (i, afi_safi) in self.afi_safis.iter().enumerate() {
            if self.afi_safis[..i]
                .iter()
                .any(|other| other.family == afi_safi.family)
            {
                return Err(Error::DuplicateFamily(addr, afi_safi.family));
            }
            let pct = afi_safi.prefix_limit.shutdown_threshold_pct;
            if pct > 100 {
                return Err(Error::PrefixThreshold(addr, pct));
            }
        }
        Ok(())
    }

    /// Check if the peer is in our AS
    #[must_use]
    pub const fn is_ibgp(&self) -> bool {
        self.peer_as == self.local_as
    }

    /// Check if the peer is in another member AS of our confederation
    #[must_use]
    pub fn is_confederation_member(&self, global: &Global) -> bool {
        global.confederation.enabled
            && !self.is_ibgp()
            && global.confederation.member_as_list.contains(&self.peer_as)
    }

    /// Configured address families, in configuration order
    #[must_use]
    pub fn families(&self) -> Vec<Family> {
        self.afi_safis.iter().map(|afi_safi| afi_safi.family).collect()
    }

    /// Settings of one address family
    #[must_use]
    pub fn afi_safi(&self, family: Family) -> Option<&AfiSafi> {
        self.afi_safis
            .iter()
            .find(|afi_safi| afi_safi.family == family)
    }

    /// ADD-PATH directions we are willing to use, per family
    #[must_use]
    pub fn add_path_modes(&self) -> Vec<(Family, AddPathMode)> {
        self.afi_safis
            .iter()
            .map(|afi_safi| {
                let mode = AddPathMode {
                    receive: afi_safi.add_paths.receive,
                    send: afi_safi.add_paths.send_max > 0,
                };
                (afi_safi.family, mode)
            })
            .filter(|(_, mode)| !mode.is_none())
            .collect()
    }
}

/// Timer settings, in seconds
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Timers {
    pub connect_retry: u64,
    pub hold_time: u16,
    /// 0 means a third of the hold time
    pub keepalive_interval: u16,
    pub idle_hold_time_after_reset: u64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            connect_retry: 120,
            hold_time: 90,
            keepalive_interval: 0,
            idle_hold_time_after_reset: 30,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct Transport {
    /// Only wait for the peer to connect
    pub passive_mode: bool,
    pub local_address: Option<IpAddr>,
    pub remote_port: u16,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            passive_mode: false,
            local_address: None,
            remote_port: BGP_PORT,
        }
    }
}

/// Revised UPDATE error handling (RFC 7606)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct ErrorHandling {
    pub treat_as_withdraw: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct EbgpMultihop {
    pub enabled: bool,
    pub multihop_ttl: u8,
}

/// Generalized TTL security (RFC 5082)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct TtlSecurity {
    pub enabled: bool,
    pub ttl_min: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct RouteReflector {
    #[cfg_attr(feature = "impl-serde", serde(rename = "route-reflector-client"))]
    pub client: bool,
    #[cfg_attr(feature = "impl-serde", serde(rename = "route-reflector-cluster-id"))]
    pub cluster_id: Option<Ipv4Addr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct AsPathOptions {
    /// How many times our AS may appear in a received AS_PATH
    pub allow_own_as: u8,
}

/// Graceful restart (RFC 4724, RFC 8538, RFC 9494)
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct GracefulRestart {
    pub enabled: bool,
    /// Seconds, 12 bits on the wire
    pub restart_time: u16,
    /// Help peers restart without preserving our own state
    pub helper_only: bool,
    pub notification_enabled: bool,
    pub long_lived_enabled: bool,
    /// Set while this speaker itself is restarting
    pub local_restarting: bool,
}

impl Default for GracefulRestart {
    fn default() -> Self {
        Self {
            enabled: false,
            restart_time: 120,
            helper_only: false,
            notification_enabled: false,
            long_lived_enabled: false,
            local_restarting: false,
        }
    }
}

/// Settings of one address family
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct AfiSafi {
    pub family: Family,
    #[cfg_attr(feature = "impl-serde", serde(default))]
    pub add_paths: AddPaths,
    #[cfg_attr(feature = "impl-serde", serde(default))]
    pub mp_graceful_restart: MpGracefulRestart,
    #[cfg_attr(feature = "impl-serde", serde(default))]
    pub long_lived_graceful_restart: LongLivedGracefulRestart,
    #[cfg_attr(feature = "impl-serde", serde(default))]
    pub prefix_limit: PrefixLimit,
}

impl AfiSafi {
    #[must_use]
    pub fn new(family: Family) -> Self {
        Self {
            family,
            add_paths: AddPaths::default(),
            mp_graceful_restart: MpGracefulRestart::default(),
            long_lived_graceful_restart: LongLivedGracefulRestart::default(),
            prefix_limit: PrefixLimit::default(),
        }
    }
}

/// ADD-PATH (RFC 7911)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct AddPaths {
    pub receive: bool,
    /// Number of paths to send, 0 to disable
    pub send_max: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct MpGracefulRestart {
    pub enabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct LongLivedGracefulRestart {
    pub enabled: bool,
    /// Stale time in seconds, 24 bits on the wire
    pub restart_time: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "impl-serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct PrefixLimit {
    /// 0 for no limit
    pub max_prefixes: u32,
    /// Warn once the count is above this percentage of the maximum
    pub shutdown_threshold_pct: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global() -> Global {
        Global {
            asn: 65000,
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            ..Global::default()
        }
    }

    #[test]
    fn test_neighbor_defaults() {
        let mut neighbor = Neighbor::new("2001:db8::2".parse().unwrap(), 65001);
        neighbor.validate(&global()).unwrap();
        assert_eq!(neighbor.local_as, 65000);
        assert_eq!(neighbor.timers.keepalive_interval, 30);
        assert_eq!(neighbor.families(), vec![Family::IPV6_UNICAST]);
        assert!(!neighbor.is_ibgp());
        assert!(neighbor.add_path_modes().is_empty());
    }

    #[test]
    fn test_neighbor_conflicts() {
        let addr: IpAddr = "192.0.2.2".parse().unwrap();
        let mut neighbor = Neighbor::new(addr, 65001);
        neighbor.ebgp_multihop.enabled = true;
        neighbor.ttl_security.enabled = true;
        assert!(matches!(
            neighbor.validate(&global()),
            Err(Error::MultihopTtlSecurity(_))
        ));

        let mut neighbor = Neighbor::new(addr, 65001);
        neighbor.timers.hold_time = 2;
        assert!(matches!(
            neighbor.validate(&global()),
            Err(Error::HoldTime(_, 2))
        ));

        let mut neighbor = Neighbor::new(addr, 65001);
        neighbor.timers.keepalive_interval = 91;
        assert!(matches!(
            neighbor.validate(&global()),
            Err(Error::Keepalive(_, 91))
        ));

        let mut neighbor = Neighbor::new(addr, 65001);
        neighbor.afi_safis = vec![
            AfiSafi::new(Family::IPV4_UNICAST),
            AfiSafi::new(Family::IPV4_UNICAST),
        ];
        assert!(matches!(
            neighbor.validate(&global()),
            Err(Error::DuplicateFamily(..))
        ));

        let mut neighbor = Neighbor::new(addr, 0);
        assert!(matches!(
            neighbor.validate(&global()),
            Err(Error::NoAsn(_))
        ));
    }

    #[test]
    fn test_config_conflicts() {
        let neighbor = Neighbor::new("192.0.2.2".parse().unwrap(), 65001);
        let mut config = Config {
            global: global(),
            neighbors: vec![neighbor.clone(), neighbor],
        };
        assert!(matches!(
            config.validate(),
            Err(Error::DuplicateNeighbor(_))
        ));
        config.neighbors.pop();
        config.validate().unwrap();
        config.global.router_id = Ipv4Addr::UNSPECIFIED;
        assert!(matches!(config.validate(), Err(Error::NoRouterId)));
    }

    #[cfg(all(feature = "toml", feature = "impl-serde"))]
    #[test]
    fn test_parse_toml() {
        let text = r#"
            [global]
            as = 65000
            router-id = "192.0.2.1"
            listen-addresses = ["::"]

            [[neighbors]]
            neighbor-address = "192.0.2.2"
            peer-as = 65001
            description = "upstream"

            [neighbors.timers]
            hold-time = 30

            [neighbors.graceful-restart]
            enabled = true
            restart-time = 90

            [[neighbors.afi-safis]]
            family = "ipv4-unicast"
            add-paths = { receive = true, send-max = 2 }
            mp-graceful-restart = { enabled = true }
            prefix-limit = { max-prefixes = 1000, shutdown-threshold-pct = 80 }

            [[neighbors.afi-safis]]
            family = "ipv6-unicast"
        "#;
        let mut config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.global.port, BGP_PORT);
        let neighbor = &config.neighbors[0];
        assert_eq!(neighbor.timers.keepalive_interval, 10);
        assert_eq!(neighbor.timers.connect_retry, 120);
        assert_eq!(neighbor.transport.remote_port, BGP_PORT);
        assert!(neighbor.graceful_restart.enabled);
        assert_eq!(
            neighbor.families(),
            vec![Family::IPV4_UNICAST, Family::IPV6_UNICAST]
        );
        assert_eq!(
            neighbor.add_path_modes(),
            vec![(
                Family::IPV4_UNICAST,
                AddPathMode {
                    receive: true,
                    send: true
                }
            )]
        );
        let limit = &neighbor.afi_safi(Family::IPV4_UNICAST).unwrap().prefix_limit;
        assert_eq!(limit.max_prefixes, 1000);
    }
}
