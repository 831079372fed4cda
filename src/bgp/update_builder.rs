//! Build UPDATE messages.

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::cidr::Cidr;
use super::endec::{Component, HEADER_LEN, MAX_MESSAGE_LEN};
use super::path::{self, AsPath, AsSegment, AsSegmentType, MpNextHop, Origin, PathAttributes};
use super::route::Routes;
use super::{Error, Family, Update};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Withdrawn routes length and total path attribute length
const UPDATE_HEADER_LEN: usize = 4;
/// Flags, type, and two length octets
const EXTENDED_ATTR_HEADER_LEN: usize = 4;

#[derive(Clone, Debug, Default, PartialEq)]
/// Builder for UPDATE messages.
pub struct UpdateBuilder {
    pub withdrawn: BTreeMap<Family, Routes>,
    pub nlri: BTreeMap<Family, Routes>,
    pub origin: Option<Origin>,
    pub as_path: Option<AsPath>,
    pub next_hop: Option<MpNextHop>,
    pub other_path_attrs: PathAttributes,
    pub enable_mp_bgp: bool,
}

impl UpdateBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new(enable_mp_bgp: bool) -> Self {
        Self {
            enable_mp_bgp,
            ..Default::default()
        }
    }

    /// Withdraw some routes of an address family.
    #[must_use]
    pub fn withdraw_routes(mut self, family: Family, routes: Routes) -> Self {
        self.withdrawn.entry(family).or_default().0.extend(routes.0);
        self
    }

    /// Withdraw a single unicast route.
    #[must_use]
    pub fn withdraw_route(mut self, route: Cidr) -> Self {
        let family = Self::unicast_family(route);
        self.withdrawn.entry(family).or_default().0.push(route.into());
        self
    }

    /// Add some routes of an address family.
    #[must_use]
    pub fn add_routes(mut self, family: Family, routes: Routes) -> Self {
        self.nlri.entry(family).or_default().0.extend(routes.0);
        self
    }

    /// Add a single unicast route.
    #[must_use]
    pub fn add_route(mut self, route: Cidr) -> Self {
        let family = Self::unicast_family(route);
        self.nlri.entry(family).or_default().0.push(route.into());
        self
    }

    const fn unicast_family(route: Cidr) -> Family {
        match route {
            Cidr::V4(_) => Family::IPV4_UNICAST,
            Cidr::V6(_) => Family::IPV6_UNICAST,
        }
    }

    /// Set the origin.
    #[must_use]
    pub fn set_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Add an AS path segment.
    #[must_use]
    pub fn set_as_path(mut self, type_: AsSegmentType, asns: Vec<u32>) -> Self {
        let as4 = asns.iter().any(|&asn| asn > u32::from(u16::MAX));
        let segment = AsSegment { type_, asns, as4 };
        self.as_path.get_or_insert_with(AsPath::default).0.push(segment);
        self
    }

    /// Set the next hop.
    #[must_use]
    pub fn set_next_hop(mut self, next_hop: MpNextHop) -> Self {
        self.next_hop = Some(next_hop);
        self
    }

    /// Add a path attribute.
    #[must_use]
    pub fn path_attribute(mut self, attr: path::Value) -> Self {
        self.other_path_attrs.0.push(attr);
        self
    }

    /// Add every attribute from a set.
    ///
    /// NEXT_HOP, MP_REACH_NLRI, and MP_UNREACH_NLRI are generated by the
    /// builder and must not be included.
    #[must_use]
    pub fn path_attributes(mut self, attrs: PathAttributes) -> Self {
        self.other_path_attrs.0.extend(attrs.0);
        self
    }

    /// Check that what is to be sent can be represented.
    fn check(&self) -> Result<(), Error> {
        let has_nlri = self.nlri.values().any(|routes| !routes.is_empty());
        if has_nlri && self.next_hop.is_none() {
            return Err(Error::NoNextHop);
        }
        if self.enable_mp_bgp {
            return Ok(());
        }
        let only_ipv4 = self
            .withdrawn
            .iter()
            .chain(self.nlri.iter())
            .all(|(family, routes)| *family == Family::IPV4_UNICAST || routes.is_empty());
        let v4_next_hop = !has_nlri || matches!(self.next_hop, Some(MpNextHop::Single(IpAddr::V4(_))));
        if only_ipv4 && v4_next_hop {
            Ok(())
        } else {
            Err(Error::NoMpBgp)
        }
    }

    /// Make an MP_UNREACH_NLRI path attribute from a list of routes.
    fn make_mp_unreach_nlri(routes: Routes, family: Family) -> path::Value {
        let mp_unreach_nlri = path::MpUnreachNlri {
            afi: family.afi,
            safi: family.safi,
            withdrawn_routes: routes,
        };
        path::Value {
            flags: path::Flags::OPTIONAL_TRANSITIVE_EXTENDED,
            data: path::Data::MpUnreachNlri(mp_unreach_nlri),
        }
    }

    /// Make an MP_REACH_NLRI path attribute from a list of routes.
    fn make_mp_reach_nlri(routes: Routes, family: Family, next_hop: MpNextHop) -> path::Value {
        let mp_reach_nlri = path::MpReachNlri {
            afi: family.afi,
            safi: family.safi,
            next_hop,
            nlri: routes,
        };
        path::Value {
            flags: path::Flags::OPTIONAL_TRANSITIVE_EXTENDED,
            data: path::Data::MpReachNlri(mp_reach_nlri),
        }
    }

    /// Split routes into chunks of at most `allowed_size` encoded bytes.
    fn chunks(routes: Routes, allowed_size: usize) -> Vec<Routes> {
        let route_splits = routes.split_routes_to_allowed_size_rev(allowed_size);
        if route_splits.len() == 1 && routes.encoded_len() > allowed_size {
            log::warn!("Routes do not fit in any UPDATE message, dropping them");
            return Vec::new();
        }
        let mut leftover = routes.0;
        let mut chunks = Vec::with_capacity(route_splits.len());
        for end in route_splits {
            chunks.push(leftover.split_off(end).into());
        }
        // Keep the original order of the routes
        chunks.reverse();
        chunks
    }

    /// Build one or more UPDATE messages depending on the size of routes.
    ///
    /// Withdrawals come first and carry no path attributes.
    pub fn build(self) -> Result<Vec<Update>, Error> {
        // The algorithm is quite simple and not very efficient.
        self.check()?;
        let Self {
            withdrawn,
            nlri,
            origin,
            as_path,
            next_hop,
            other_path_attrs: mut small_attrs,
            enable_mp_bgp,
        } = self;
        // Prepare path attributes that are common for all UPDATE messages
        if let Some(origin) = origin {
            small_attrs.0.push(path::Value {
                flags: path::Flags::WELL_KNOWN_COMPLETE,
                data: path::Data::Origin(origin),
            });
        }
        if let Some(as_path) = as_path {
            small_attrs.0.push(path::Value {
                flags: path::Flags::WELL_KNOWN_COMPLETE,
                data: path::Data::AsPath(as_path),
            });
        }
        let max_body = MAX_MESSAGE_LEN - HEADER_LEN - UPDATE_HEADER_LEN;
        let mut updates = Vec::new();
        // First send withdrawn routes
        for (family, routes) in withdrawn {
            if routes.is_empty() {
                continue;
            }
            if enable_mp_bgp {
                // MP_UNREACH_NLRI header is AFI and SAFI
                let allowed_size = max_body - EXTENDED_ATTR_HEADER_LEN - 3;
                for chunk in Self::chunks(routes, allowed_size) {
                    updates.push(Update {
                        path_attributes: PathAttributes(vec![Self::make_mp_unreach_nlri(
                            chunk, family,
                        )]),
                        ..Update::default()
                    });
                }
            } else {
                for chunk in Self::chunks(routes, max_body) {
                    updates.push(Update {
                        withdrawn_routes: chunk,
                        ..Update::default()
                    });
                }
            }
        }
        // Then send NLRI
        let Some(next_hop) = next_hop else {
            // `check` ensures that there are no NLRI components
            return Ok(updates);
        };
        for (family, routes) in nlri {
            if routes.is_empty() {
                continue;
            }
            if enable_mp_bgp {
                // MP_REACH_NLRI header is AFI, SAFI, next hop length, next hop, and reserved
                let allowed_size = max_body
                    - small_attrs.encoded_len()
                    - EXTENDED_ATTR_HEADER_LEN
                    - 5
                    - next_hop.encoded_len();
                for chunk in Self::chunks(routes, allowed_size) {
                    let mut this_path_attributes = small_attrs.clone();
                    this_path_attributes
                        .0
                        .push(Self::make_mp_reach_nlri(chunk, family, next_hop));
                    updates.push(Update {
                        path_attributes: this_path_attributes,
                        ..Update::default()
                    });
                }
            } else if let MpNextHop::Single(IpAddr::V4(next_hop)) = next_hop {
                let mut this_path_attributes = small_attrs.clone();
                this_path_attributes.0.push(path::Value {
                    flags: path::Flags::WELL_KNOWN_COMPLETE,
                    data: path::Data::NextHop(next_hop),
                });
                let allowed_size = max_body - this_path_attributes.encoded_len();
                for chunk in Self::chunks(routes, allowed_size) {
                    updates.push(Update {
                        path_attributes: this_path_attributes.clone(),
                        nlri: chunk,
                        ..Update::default()
                    });
                }
            }
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::cidr::{Cidr4, Cidr6};
    use crate::bgp::{Codec, Message};
    use bytes::BytesMut;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio_util::codec::Encoder;

    fn encoded_len(update: Update) -> usize {
        let mut dst = BytesMut::new();
        Codec::default()
            .encode(Message::Update(update), &mut dst)
            .unwrap();
        dst.len()
    }

    #[test]
    fn test_vanilla_ipv4() {
        let updates = UpdateBuilder::new(false)
            .withdraw_route(Cidr::V4(Cidr4::new(Ipv4Addr::new(10, 0, 0, 0), 8)))
            .add_route(Cidr::V4(Cidr4::new(Ipv4Addr::new(192, 0, 2, 0), 24)))
            .set_origin(Origin::Igp)
            .set_as_path(AsSegmentType::AsSequence, vec![65001])
            .set_next_hop(MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))))
            .build()
            .unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].withdrawn_routes.len(), 1);
        assert!(updates[0].path_attributes.is_empty());
        assert_eq!(updates[1].nlri.len(), 1);
        assert_eq!(
            updates[1]
                .path_attributes
                .get(path::Type::NextHop)
                .unwrap()
                .data,
            path::Data::NextHop(Ipv4Addr::new(192, 0, 2, 1))
        );
    }

    #[test]
    fn test_vanilla_rejects_ipv6() {
        let result = UpdateBuilder::new(false)
            .add_route(Cidr::V6(Cidr6::new(Ipv6Addr::LOCALHOST, 128)))
            .set_next_hop(MpNextHop::Single(IpAddr::V6(Ipv6Addr::LOCALHOST)))
            .build();
        assert!(matches!(result, Err(Error::NoMpBgp)));
        let result = UpdateBuilder::new(true)
            .add_route(Cidr::V6(Cidr6::new(Ipv6Addr::LOCALHOST, 128)))
            .build();
        assert!(matches!(result, Err(Error::NoNextHop)));
    }

    #[test]
    fn test_large_mp_split() {
        let routes: Routes = (0..2000u32)
            .map(|i| {
                Cidr6::new(
                    Ipv6Addr::new(0x2001, 0xdb8, (i >> 8) as u16, (i & 0xff) as u16, 0, 0, 0, 0),
                    64,
                )
            })
            .collect::<Vec<_>>()
            .into();
        let updates = UpdateBuilder::new(true)
            .add_routes(Family::IPV6_UNICAST, routes.clone())
            .set_origin(Origin::Igp)
            .set_as_path(AsSegmentType::AsSequence, vec![4_200_000_000])
            .set_next_hop(MpNextHop::Single(IpAddr::V6(Ipv6Addr::LOCALHOST)))
            .build()
            .unwrap();
        assert!(updates.len() > 1);
        let mut collected = Vec::new();
        for update in updates {
            let reach = update.path_attributes.get(path::Type::MpReachNlri).unwrap();
            let path::Data::MpReachNlri(reach) = &reach.data else {
                panic!("not MP_REACH_NLRI");
            };
            assert_eq!(reach.family(), Family::IPV6_UNICAST);
            collected.extend(reach.nlri.0.clone());
            assert!(encoded_len(update) <= MAX_MESSAGE_LEN);
        }
        assert_eq!(collected, routes.0);
    }
}
