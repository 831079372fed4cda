//! Conversion between UPDATE messages and lists of paths
//!
//! The speaker does not select routes. Paths learned from a peer are handed
//! to whoever subscribes to the server's events, and paths to be sent are
//! given back in the same form.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::bgp::path::{self, MpNextHop, PathAttributes};
use crate::bgp::route::{self, Routes};
use crate::bgp::{Family, Update, UpdateBuilder};
use crate::fsm::PeerInfo;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

/// A route with its attributes
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    pub family: Family,
    pub nlri: route::Value,
    /// Attributes without NEXT_HOP, MP_REACH_NLRI, and MP_UNREACH_NLRI,
    /// shared by the paths of one UPDATE
    pub attributes: Arc<PathAttributes>,
    pub next_hop: Option<MpNextHop>,
    pub withdrawal: bool,
    /// Kept but not to be used, for example because of an AS_PATH loop
    pub rejected: bool,
    /// The peer this path was learned from, or `None` for local paths
    pub source: Option<Arc<PeerInfo>>,
    pub timestamp: SystemTime,
}

impl Path {
    /// A path to be advertised
    #[must_use]
    pub fn new(
        family: Family,
        nlri: route::Value,
        attributes: Arc<PathAttributes>,
        next_hop: MpNextHop,
    ) -> Self {
        Self {
            family,
            nlri,
            attributes,
            next_hop: Some(next_hop),
            withdrawal: false,
            rejected: false,
            source: None,
            timestamp: SystemTime::now(),
        }
    }

    /// A withdrawal of `nlri`
    #[must_use]
    pub fn withdrawal(family: Family, nlri: route::Value) -> Self {
        Self {
            family,
            nlri,
            attributes: Arc::default(),
            next_hop: None,
            withdrawal: true,
            rejected: false,
            source: None,
            timestamp: SystemTime::now(),
        }
    }
}

/// Split a received UPDATE into paths
///
/// Paths of `disabled` families are left out. With `treat_as_withdraw`
/// every announced route becomes a withdrawal (RFC 7606 Section 2).
#[must_use]
pub fn paths_from_update(
    update: Update,
    source: Option<Arc<PeerInfo>>,
    disabled: &[Family],
    treat_as_withdraw: bool,
) -> Vec<Path> {
    let timestamp = SystemTime::now();
    let Update {
        withdrawn_routes,
        path_attributes,
        nlri,
    } = update;
    let mut withdrawn = vec![(Family::IPV4_UNICAST, withdrawn_routes)];
    let mut reach = Vec::new();
    let mut next_hop = None;
    let mut attributes = Vec::with_capacity(path_attributes.len());
    for attr in path_attributes.0 {
        match attr.data {
            path::Data::MpReachNlri(mp) => {
                reach.push((mp.family(), mp.nlri, Some(mp.next_hop)));
            }
            path::Data::MpUnreachNlri(mp) => {
                withdrawn.push((mp.family(), mp.withdrawn_routes));
            }
            path::Data::NextHop(addr) => next_hop = Some(MpNextHop::Single(IpAddr::V4(addr))),
            _ => attributes.push(attr),
        }
    }
    if !nlri.is_empty() {
        reach.push((Family::IPV4_UNICAST, nlri, next_hop));
    }
    let attributes = Arc::new(PathAttributes(attributes));
    let mut paths = Vec::new();
    for (family, routes) in withdrawn {
        if disabled.contains(&family) {
            continue;
        }
        for nlri in routes.0 {
            paths.push(Path {
                source: source.clone(),
                timestamp,
                ..Path::withdrawal(family, nlri)
            });
        }
    }
    for (family, routes, next_hop) in reach {
        if disabled.contains(&family) {
            continue;
        }
        for nlri in routes.0 {
            paths.push(Path {
                family,
                nlri,
                attributes: Arc::clone(&attributes),
                next_hop,
                withdrawal: treat_as_withdraw,
                rejected: false,
                source: source.clone(),
                timestamp,
            });
        }
    }
    paths
}

/// Check if our AS appears in the AS_PATH more often than allowed
#[must_use]
pub fn has_own_as_loop(own_as: u32, allow_own_as: u8, attributes: &PathAttributes) -> bool {
    attributes
        .as_path()
        .is_some_and(|as_path| as_path.count(own_as) > usize::from(allow_own_as))
}

/// Mark received paths with an AS_PATH loop as rejected
pub fn reject_own_as_loops(paths: &mut [Path], own_as: u32, allow_own_as: u8) {
    for path in paths.iter_mut().filter(|path| !path.withdrawal) {
        if has_own_as_loop(own_as, allow_own_as, &path.attributes) {
            log::debug!("Rejecting {:?} {:?}: AS_PATH loop", path.family, path.nlri);
            path.rejected = true;
        }
    }
}

/// What the peer can receive
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Negotiated address families
    pub families: Vec<Family>,
    /// Families for which path identifiers are sent
    pub add_path_send: Vec<Family>,
    /// The peer does not support four-octet AS numbers
    pub two_byte_as: bool,
}

/// Pack paths into as few UPDATE messages as possible
///
/// Paths with the same family, next hop, and attributes share messages.
#[must_use]
pub fn updates_from_paths(paths: Vec<Path>, opts: &SendOptions) -> Vec<Update> {
    let mut withdrawn: Vec<(Family, Routes)> = Vec::new();
    let mut groups: Vec<(Family, MpNextHop, Arc<PathAttributes>, Routes)> = Vec::new();
    for path in paths {
        if !opts.families.contains(&path.family) {
            log::debug!("Dropping path of non-negotiated family {}", path.family);
            continue;
        }
        let nlri = if opts.add_path_send.contains(&path.family) {
            let path_id = path.nlri.path_id.unwrap_or(0);
            path.nlri.with_path_id(Some(path_id))
        } else {
            path.nlri.with_path_id(None)
        };
        if path.withdrawal {
            match withdrawn.iter_mut().find(|(family, _)| *family == path.family) {
                Some((_, routes)) => routes.0.push(nlri),
                None => withdrawn.push((path.family, Routes(vec![nlri]))),
            }
            continue;
        }
        let Some(next_hop) = path.next_hop else {
            log::warn!("Dropping path without next hop: {} {nlri:?}", path.family);
            continue;
        };
        let group = groups.iter_mut().find(|(family, nh, attrs, _)| {
            *family == path.family && *nh == next_hop && **attrs == *path.attributes
        });
        match group {
            Some((_, _, _, routes)) => routes.0.push(nlri),
            None => groups.push((path.family, next_hop, path.attributes, Routes(vec![nlri]))),
        }
    }
    let mut updates = Vec::new();
    for (family, routes) in withdrawn {
        let builder = UpdateBuilder::new(family != Family::IPV4_UNICAST);
        extend_or_log(&mut updates, builder.withdraw_routes(family, routes));
    }
    for (family, next_hop, attributes, routes) in groups {
        let mut attributes = (*attributes).clone();
        attributes.set_four_octet_as(!opts.two_byte_as);
        let vanilla = family == Family::IPV4_UNICAST
            && matches!(next_hop, MpNextHop::Single(IpAddr::V4(_)));
        let builder = UpdateBuilder::new(!vanilla)
            .add_routes(family, routes)
            .set_next_hop(next_hop)
            .path_attributes(attributes);
        extend_or_log(&mut updates, builder);
    }
    updates
}

fn extend_or_log(updates: &mut Vec<Update>, builder: UpdateBuilder) {
    match builder.build() {
        Ok(built) => updates.extend(built),
        Err(e) => log::warn!("Cannot build UPDATE: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::cidr::{Cidr, Cidr4, Cidr6};
    use crate::bgp::path::{AsPath, AsSegment, AsSegmentType, Flags, Origin};
    use crate::bgp::AS_TRANS;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn attributes(asns: &[u32]) -> Arc<PathAttributes> {
        Arc::new(PathAttributes(vec![
            path::Value {
                flags: Flags::WELL_KNOWN_COMPLETE,
                data: path::Data::Origin(Origin::Igp),
            },
            path::Value {
                flags: Flags::WELL_KNOWN_COMPLETE,
                data: path::Data::AsPath(AsPath(vec![AsSegment {
                    type_: AsSegmentType::AsSequence,
                    asns: asns.to_vec(),
                    as4: true,
                }])),
            },
        ]))
    }

    fn v4(addr: [u8; 4], len: u8) -> route::Value {
        Cidr4::new(Ipv4Addr::from(addr), len).into()
    }

    #[test]
    fn test_paths_round_trip() {
        let attrs = attributes(&[65001, 65002]);
        let nh4 = MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let nh6 = MpNextHop::Single(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
        let prefix6 = route::Value::from(Cidr6::new(Ipv6Addr::new(0x2001, 0xdb8, 1, 0, 0, 0, 0, 0), 48));
        let paths = vec![
            Path::new(Family::IPV4_UNICAST, v4([198, 51, 100, 0], 24), Arc::clone(&attrs), nh4),
            Path::new(Family::IPV4_UNICAST, v4([203, 0, 113, 0], 24), Arc::clone(&attrs), nh4),
            Path::new(Family::IPV6_UNICAST, prefix6.clone(), Arc::clone(&attrs), nh6),
            Path::withdrawal(Family::IPV4_UNICAST, v4([10, 0, 0, 0], 8)),
            Path::new(Family::IPV4_MULTICAST, v4([10, 0, 0, 0], 8), attrs, nh4),
        ];
        let opts = SendOptions {
            families: vec![Family::IPV4_UNICAST, Family::IPV6_UNICAST],
            ..SendOptions::default()
        };
        let updates = updates_from_paths(paths, &opts);
        // Withdrawal, IPv4 announcements, IPv6 announcement
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].withdrawn_routes.len(), 1);
        assert_eq!(updates[1].nlri.len(), 2);

        let received: Vec<_> = updates
            .into_iter()
            .flat_map(|update| paths_from_update(update, None, &[], false))
            .collect();
        assert_eq!(received.len(), 4);
        assert!(received[0].withdrawal);
        assert_eq!(received[1].next_hop, Some(nh4));
        assert_eq!(received[1].attributes, received[2].attributes);
        assert_eq!(received[3].family, Family::IPV6_UNICAST);
        assert_eq!(received[3].nlri, prefix6);
        assert_eq!(received[3].next_hop, Some(nh6));
        assert_eq!(*received[3].attributes, *attributes(&[65001, 65002]));
    }

    #[test]
    fn test_two_byte_peer() {
        let nh4 = MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let paths = vec![Path::new(
            Family::IPV4_UNICAST,
            v4([198, 51, 100, 0], 24),
            attributes(&[4_200_000_000]),
            nh4,
        )];
        let opts = SendOptions {
            families: vec![Family::IPV4_UNICAST],
            add_path_send: vec![Family::IPV4_UNICAST],
            two_byte_as: true,
        };
        let updates = updates_from_paths(paths, &opts);
        assert_eq!(updates.len(), 1);
        let as_path = updates[0].path_attributes.as_path().unwrap();
        assert_eq!(as_path[0].asns, vec![u32::from(AS_TRANS)]);
        assert!(!as_path[0].as4);
        assert!(updates[0].path_attributes.get(path::Type::As4Path).is_some());
        assert_eq!(updates[0].nlri[0].path_id, Some(0));
    }

    #[test]
    fn test_treat_as_withdraw_and_disabled() {
        let update = UpdateBuilder::new(false)
            .add_route(Cidr::V4(Cidr4::new(Ipv4Addr::new(198, 51, 100, 0), 24)))
            .set_next_hop(MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))))
            .path_attributes((*attributes(&[65001])).clone())
            .build()
            .unwrap()
            .remove(0);
        let paths = paths_from_update(update.clone(), None, &[], true);
        assert_eq!(paths.len(), 1);
        assert!(paths[0].withdrawal);
        assert!(paths_from_update(update, None, &[Family::IPV4_UNICAST], false).is_empty());
    }

    #[test]
    fn test_own_as_loop() {
        let mut paths = vec![Path::new(
            Family::IPV4_UNICAST,
            v4([198, 51, 100, 0], 24),
            attributes(&[65001, 65000, 65002]),
            MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
        )];
        reject_own_as_loops(&mut paths, 65000, 1);
        assert!(!paths[0].rejected);
        reject_own_as_loops(&mut paths, 65000, 0);
        assert!(paths[0].rejected);
    }
}
