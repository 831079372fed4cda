//! Capability negotiation and OPEN validation

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::{Negotiated, NegotiatedGracefulRestart, PeerInfo};
use crate::bgp::capability::{
    self, AddPathMode, AddPathTuple, Capabilities, CapabilitiesBuilder, ExtendedNextHop,
    ExtendedNextHopValue, GracefulRestart, GracefulRestartTuple, LlgrTuple,
    LongLivedGracefulRestart, Type, Value,
};
use crate::bgp::{
    Afi, Family, Notification, NotificationErrorCode, Open, OpenMessageErrorSubcode, BGP_VERSION,
};
use crate::config::{Global, Neighbor};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Host name advertised in the FQDN capability
#[must_use]
pub fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Capabilities to advertise to `neighbor`
///
/// The same configuration always gives the same list in the same order.
#[must_use]
pub fn capabilities_from_config(neighbor: &Neighbor, hostname: &str) -> Capabilities {
    let mut builder = CapabilitiesBuilder::new().route_refresh().fqdn(hostname, "");
    let families = neighbor.families();
    for family in &families {
        builder = builder.multi_protocol(family.afi, family.safi);
    }
    builder = builder.four_octet_as_number(neighbor.local_as);

    let gr = &neighbor.graceful_restart;
    if gr.enabled {
        let tuples = if gr.helper_only {
            Vec::new()
        } else {
            neighbor
                .afi_safis
                .iter()
                .filter(|afi_safi| afi_safi.mp_graceful_restart.enabled)
                .map(|afi_safi| GracefulRestartTuple {
                    family: afi_safi.family,
                    forwarding: gr.local_restarting,
                })
                .collect()
        };
        builder = builder.graceful_restart(GracefulRestart {
            restarting: gr.local_restarting,
            notification: gr.notification_enabled,
            restart_time: gr.restart_time,
            tuples,
        });
        if gr.long_lived_enabled {
            let tuples = if gr.helper_only {
                Vec::new()
            } else {
                neighbor
                    .afi_safis
                    .iter()
                    .filter(|afi_safi| afi_safi.long_lived_graceful_restart.enabled)
                    .map(|afi_safi| LlgrTuple {
                        family: afi_safi.family,
                        forwarding: gr.local_restarting,
                        stale_time: afi_safi
                            .long_lived_graceful_restart
                            .restart_time
                            .min(LongLivedGracefulRestart::MAX_STALE_TIME),
                    })
                    .collect()
            };
            builder = builder.long_lived_graceful_restart(tuples);
        }
    }

    let enh: Vec<_> = families
        .iter()
        .filter(|family| **family != Family::IPV6_UNICAST)
        .map(|family| ExtendedNextHopValue {
            afi: family.afi,
            safi: family.safi,
            next_hop_afi: Afi::Ipv6,
        })
        .collect();
    if !enh.is_empty() {
        builder = builder.extended_next_hop(ExtendedNextHop(enh));
    }

    let add_path: Vec<_> = neighbor
        .add_path_modes()
        .into_iter()
        .map(|(family, mode)| AddPathTuple { family, mode })
        .collect();
    if !add_path.is_empty() {
        builder = builder.add_path(add_path);
    }
    builder.build()
}

/// Our OPEN message for `neighbor`
#[must_use]
pub fn build_open(global: &Global, neighbor: &Neighbor, capabilities: Capabilities) -> Open {
    Open::new_easy(
        neighbor.local_as,
        neighbor.timers.hold_time,
        global.router_id,
        capabilities,
    )
}

/// Collect the capabilities of an OPEN by code
///
/// ADD-PATH capabilities are merged into one. A peer without any
/// multiprotocol capability supports IPv4 unicast only.
#[must_use]
pub fn open_to_capabilities(open: &Open) -> BTreeMap<u8, Vec<Value>> {
    let mut caps: BTreeMap<u8, Vec<Value>> = BTreeMap::new();
    for cap in open.capabilities() {
        let entry = caps.entry(cap.code()).or_default();
        if let Value::AddPath(add_path) = cap {
            if let Some(Value::AddPath(existing)) = entry.first_mut() {
                existing.0.extend(add_path.iter().copied());
                continue;
            }
        }
        entry.push(cap.clone());
    }
    caps.entry(Type::MultiProtocol as u8)
        .or_insert_with(|| vec![Value::MultiProtocol(Family::IPV4_UNICAST.into())]);
    caps
}

/// Families in the multiprotocol capabilities of `caps`
#[must_use]
pub fn capability_families(caps: &BTreeMap<u8, Vec<Value>>) -> Vec<Family> {
    caps.get(&(Type::MultiProtocol as u8))
        .into_iter()
        .flatten()
        .filter_map(|cap| match cap {
            Value::MultiProtocol(mp) => Some(Family::from(*mp)),
            _ => None,
        })
        .collect()
}

/// ADD-PATH directions to use for each family both sides know about
///
/// We send if we want to and the peer receives, and the other way round.
#[must_use]
pub fn negotiate_add_path(
    local: &[(Family, AddPathMode)],
    remote: &[AddPathTuple],
) -> BTreeMap<Family, AddPathMode> {
    let mut result = BTreeMap::new();
    for (family, mode) in local {
        let Some(theirs) = remote.iter().find(|tuple| tuple.family == *family) else {
            continue;
        };
        let agreed = AddPathMode {
            receive: mode.receive && theirs.mode.send,
            send: mode.send && theirs.mode.receive,
        };
        if !agreed.is_none() {
            result.insert(*family, agreed);
        }
    }
    result
}

fn open_error(subcode: OpenMessageErrorSubcode, data: Bytes) -> Notification {
    Notification::new(NotificationErrorCode::OpenMessageError, subcode as u8, data)
}

/// Check the peer's OPEN against the configuration (RFC 4271 Section 6.2)
pub fn validate_open(open: &Open, global: &Global, neighbor: &Neighbor) -> Result<(), Notification> {
    if open.version != BGP_VERSION {
        let supported = u16::from(BGP_VERSION).to_be_bytes();
        return Err(open_error(
            OpenMessageErrorSubcode::UnsupportedVersionNumber,
            Bytes::copy_from_slice(&supported),
        ));
    }
    let peer_as = open.speaker_asn();
    if peer_as != neighbor.peer_as {
        log::warn!(
            "{}: peer AS {peer_as} does not match the configured {}",
            neighbor.neighbor_address,
            neighbor.peer_as
        );
        return Err(open_error(OpenMessageErrorSubcode::BadPeerAs, Bytes::new()));
    }
    if open.bgp_id.is_unspecified() || (neighbor.is_ibgp() && open.bgp_id == global.router_id) {
        return Err(open_error(
            OpenMessageErrorSubcode::BadBgpIdentifier,
            Bytes::new(),
        ));
    }
    if open.hold_time == 1 || open.hold_time == 2 {
        return Err(open_error(
            OpenMessageErrorSubcode::UnacceptableHoldTime,
            Bytes::new(),
        ));
    }
    Ok(())
}

fn find_capability<'a, T>(
    caps: &'a BTreeMap<u8, Vec<Value>>,
    type_: Type,
    f: impl Fn(&'a Value) -> Option<T>,
) -> Option<T> {
    caps.get(&(type_ as u8))?.iter().find_map(f)
}

/// Combine both OPEN messages of a session
///
/// `received_open` must have passed [`validate_open`].
#[must_use]
pub fn negotiate(
    global: &Global,
    neighbor: &Neighbor,
    sent_open: Open,
    received_open: Open,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
) -> Negotiated {
    let capabilities = open_to_capabilities(&received_open);
    let remote_families = capability_families(&capabilities);
    let families: Vec<_> = neighbor
        .families()
        .into_iter()
        .filter(|family| remote_families.contains(family))
        .collect();

    let configured_hold = neighbor.timers.hold_time;
    let hold_time = configured_hold.min(received_open.hold_time);
    let keepalive_interval = if hold_time < configured_hold {
        hold_time / 3
    } else {
        neighbor.timers.keepalive_interval
    };

    let remote_add_path = find_capability(&capabilities, Type::AddPath, |cap| match cap {
        Value::AddPath(add_path) => Some(add_path.0.as_slice()),
        _ => None,
    })
    .unwrap_or_default();
    let add_path = negotiate_add_path(&neighbor.add_path_modes(), remote_add_path);

    let gr = &neighbor.graceful_restart;
    let remote_gr = find_capability(&capabilities, Type::GracefulRestart, |cap| match cap {
        Value::GracefulRestart(gr) => Some(gr),
        _ => None,
    });
    let graceful_restart = remote_gr.filter(|_| gr.enabled).map(|remote| {
        let long_lived = find_capability(
            &capabilities,
            Type::LongLivedGracefulRestart,
            |cap| match cap {
                capability::Value::LongLivedGracefulRestart(llgr) => Some(llgr),
                _ => None,
            },
        )
        .filter(|_| gr.long_lived_enabled)
        .map(|llgr| {
            llgr.iter()
                .filter(|tuple| families.contains(&tuple.family))
                .copied()
                .collect()
        })
        .unwrap_or_default();
        NegotiatedGracefulRestart {
            restart_time: remote.restart_time,
            notification: gr.notification_enabled && remote.notification,
            families: remote
                .tuples
                .iter()
                .filter(|tuple| families.contains(&tuple.family))
                .copied()
                .collect(),
            long_lived,
        }
    });

    let peer_info = PeerInfo {
        local_as: neighbor.local_as,
        peer_as: received_open.speaker_asn(),
        local_id: global.router_id,
        peer_id: received_open.bgp_id,
        local_addr: local_addr.ip(),
        peer_addr: peer_addr.ip(),
        families,
        route_reflector_client: neighbor.route_reflector.client,
        cluster_id: neighbor.route_reflector.cluster_id,
        confederation_member: neighbor.is_confederation_member(global),
    };
    Negotiated {
        peer_info: Arc::new(peer_info),
        local_addr,
        peer_addr,
        two_byte_as: received_open.four_octet_asn().is_none(),
        route_refresh: capabilities.contains_key(&(Type::RouteRefresh as u8)),
        sent_open,
        received_open,
        capabilities,
        add_path,
        hold_time,
        keepalive_interval,
        graceful_restart,
        disabled: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::capability::{FourOctetAsNumber, MultiProtocol};
    use crate::bgp::AS_TRANS;
    use crate::config::AfiSafi;
    use std::net::Ipv4Addr;

    fn global() -> Global {
        Global {
            asn: 65000,
            router_id: Ipv4Addr::new(192, 0, 2, 1),
            ..Global::default()
        }
    }

    fn neighbor() -> Neighbor {
        let mut neighbor = Neighbor::new("192.0.2.2".parse().unwrap(), 65001);
        neighbor.validate(&global()).unwrap();
        neighbor
    }

    fn peer_open(asn: u32, hold_time: u16, caps: Vec<Value>) -> Open {
        Open::new_easy(asn, hold_time, Ipv4Addr::new(192, 0, 2, 2), caps.into())
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "192.0.2.1:40000".parse().unwrap(),
            "192.0.2.2:179".parse().unwrap(),
        )
    }

    #[test]
    fn test_capabilities_from_config() {
        let mut neighbor = neighbor();
        neighbor.afi_safis.push(AfiSafi::new(Family::IPV6_UNICAST));
        neighbor.afi_safis[0].add_paths.receive = true;
        neighbor.afi_safis[0].mp_graceful_restart.enabled = true;
        neighbor.graceful_restart.enabled = true;
        neighbor.graceful_restart.notification_enabled = true;
        let caps = capabilities_from_config(&neighbor, "router");
        let codes: Vec<u8> = caps.iter().map(Value::code).collect();
        assert_eq!(codes, vec![2, 73, 1, 1, 65, 64, 5, 69]);
        assert!(caps.has_multi_protocol(Family::IPV6_UNICAST));
        assert!(caps.has_extended_next_hop(
            Afi::Ipv4,
            crate::bgp::Safi::Unicast,
            Afi::Ipv6
        ));
        assert!(caps.has(&Value::GracefulRestart(GracefulRestart {
            restarting: false,
            notification: true,
            restart_time: 120,
            tuples: vec![GracefulRestartTuple {
                family: Family::IPV4_UNICAST,
                forwarding: false
            }],
        })));
        assert_eq!(caps, capabilities_from_config(&neighbor, "router"));

        neighbor.graceful_restart.helper_only = true;
        neighbor.graceful_restart.long_lived_enabled = true;
        let caps = capabilities_from_config(&neighbor, "router");
        assert!(caps.has(&Value::LongLivedGracefulRestart(
            LongLivedGracefulRestart::default()
        )));
    }

    #[test]
    fn test_build_open() {
        let mut neighbor = neighbor();
        neighbor.local_as = 4_200_000_000;
        let caps = capabilities_from_config(&neighbor, "");
        let open = build_open(&global(), &neighbor, caps);
        assert_eq!(open.version, 4);
        assert_eq!(open.asn, AS_TRANS);
        assert_eq!(open.hold_time, 90);
        assert_eq!(open.four_octet_asn(), Some(4_200_000_000));
    }

    #[test]
    fn test_open_with_every_family() {
        use crate::bgp::{Codec, Message, Safi};
        use bytes::BytesMut;
        use tokio_util::codec::{Decoder, Encoder};

        let mut neighbor = neighbor();
        let safis = [
            Safi::Unicast,
            Safi::Multicast,
            Safi::MplsLabel,
            Safi::Vpn,
            Safi::VpnMulticast,
        ];
        neighbor.afi_safis = [Afi::Ipv4, Afi::Ipv6]
            .into_iter()
            .flat_map(|afi| safis.map(|safi| Family { afi, safi }))
            .map(|family| {
                let mut afi_safi = AfiSafi::new(family);
                afi_safi.add_paths.receive = true;
                afi_safi.mp_graceful_restart.enabled = true;
                afi_safi.long_lived_graceful_restart.enabled = true;
                afi_safi.long_lived_graceful_restart.restart_time = 3600;
                afi_safi
            })
            .collect();
        neighbor.graceful_restart.enabled = true;
        neighbor.graceful_restart.long_lived_enabled = true;
        neighbor.validate(&global()).unwrap();

        let caps = capabilities_from_config(&neighbor, "router.example.net");
        let open = build_open(&global(), &neighbor, caps);
        // Too much for the one-octet optional parameters length
        assert!(open.opt_params.is_extended());
        let mut buf = BytesMut::new();
        Codec::default()
            .encode(Message::Open(open.clone()), &mut buf)
            .unwrap();
        assert_eq!(&buf[28..30], &[0xff, 0xff]);
        let Some(Message::Open(decoded)) = Codec::default().decode(&mut buf).unwrap() else {
            panic!("expected an OPEN");
        };
        assert_eq!(decoded, open);
        assert_eq!(capability_families(&open_to_capabilities(&decoded)).len(), 10);
    }

    #[test]
    fn test_open_to_capabilities() {
        let ap = |family, receive, send| AddPathTuple {
            family,
            mode: AddPathMode { receive, send },
        };
        let open = peer_open(
            65001,
            90,
            vec![
                Value::AddPath(capability::AddPath(vec![ap(Family::IPV4_UNICAST, true, false)])),
                Value::AddPath(capability::AddPath(vec![ap(Family::IPV6_UNICAST, true, true)])),
            ],
        );
        let caps = open_to_capabilities(&open);
        assert_eq!(capability_families(&caps), vec![Family::IPV4_UNICAST]);
        assert_eq!(
            caps[&(Type::AddPath as u8)],
            vec![Value::AddPath(capability::AddPath(vec![
                ap(Family::IPV4_UNICAST, true, false),
                ap(Family::IPV6_UNICAST, true, true),
            ]))]
        );
    }

    #[test]
    fn test_negotiate_add_path() {
        for bits in 0..16u8 {
            let local = AddPathMode {
                receive: bits & 1 != 0,
                send: bits & 2 != 0,
            };
            let remote = AddPathMode {
                receive: bits & 4 != 0,
                send: bits & 8 != 0,
            };
            let result = negotiate_add_path(
                &[(Family::IPV4_UNICAST, local)],
                &[AddPathTuple {
                    family: Family::IPV4_UNICAST,
                    mode: remote,
                }],
            );
            let mode = result
                .get(&Family::IPV4_UNICAST)
                .copied()
                .unwrap_or_default();
            assert_eq!(mode.send, local.send && remote.receive);
            assert_eq!(mode.receive, local.receive && remote.send);
        }
        assert!(negotiate_add_path(
            &[(
                Family::IPV6_UNICAST,
                AddPathMode {
                    receive: true,
                    send: true
                }
            )],
            &[]
        )
        .is_empty());
    }

    #[test]
    fn test_validate_open() {
        let global = global();
        let neighbor = neighbor();
        let good = peer_open(65001, 30, vec![]);
        assert!(validate_open(&good, &global, &neighbor).is_ok());

        let mut open = good.clone();
        open.version = 3;
        let notification = validate_open(&open, &global, &neighbor).unwrap_err();
        assert_eq!(
            notification.error_subcode,
            OpenMessageErrorSubcode::UnsupportedVersionNumber as u8
        );
        assert_eq!(&notification.data[..], &[0, 4]);

        let open = peer_open(65002, 30, vec![]);
        assert_eq!(
            validate_open(&open, &global, &neighbor)
                .unwrap_err()
                .error_subcode,
            OpenMessageErrorSubcode::BadPeerAs as u8
        );

        // The four-octet capability wins over the two-octet field
        let open = peer_open(
            65001,
            30,
            vec![Value::FourOctetAsNumber(FourOctetAsNumber { asn: 65002 })],
        );
        assert!(validate_open(&open, &global, &neighbor).is_err());

        let mut open = good.clone();
        open.bgp_id = Ipv4Addr::UNSPECIFIED;
        assert_eq!(
            validate_open(&open, &global, &neighbor)
                .unwrap_err()
                .error_subcode,
            OpenMessageErrorSubcode::BadBgpIdentifier as u8
        );

        let mut ibgp = neighbor.clone();
        ibgp.peer_as = 65000;
        let mut open = peer_open(65000, 30, vec![]);
        open.bgp_id = global.router_id;
        assert!(validate_open(&open, &global, &ibgp).is_err());

        let open = peer_open(65001, 2, vec![]);
        assert_eq!(
            validate_open(&open, &global, &neighbor)
                .unwrap_err()
                .error_subcode,
            OpenMessageErrorSubcode::UnacceptableHoldTime as u8
        );
    }

    #[test]
    fn test_negotiate_timers() {
        let global = global();
        let neighbor = neighbor();
        let sent = build_open(&global, &neighbor, capabilities_from_config(&neighbor, ""));
        let (local, peer) = addrs();

        let received = peer_open(65001, 30, vec![]);
        let negotiated = negotiate(&global, &neighbor, sent.clone(), received, local, peer);
        assert_eq!(negotiated.hold_time, 30);
        assert_eq!(negotiated.keepalive_interval, 10);
        assert!(negotiated.two_byte_as);
        assert!(!negotiated.route_refresh);
        assert_eq!(negotiated.families(), &[Family::IPV4_UNICAST]);
        assert_eq!(negotiated.peer_info.peer_as, 65001);

        let received = peer_open(
            65001,
            180,
            vec![
                Value::RouteRefresh,
                Value::FourOctetAsNumber(FourOctetAsNumber { asn: 65001 }),
                Value::MultiProtocol(MultiProtocol::from(Family::IPV6_UNICAST)),
            ],
        );
        let negotiated = negotiate(&global, &neighbor, sent, received, local, peer);
        assert_eq!(negotiated.hold_time, 90);
        assert_eq!(negotiated.keepalive_interval, 30);
        assert!(!negotiated.two_byte_as);
        assert!(negotiated.route_refresh);
        // The peer only does IPv6
        assert!(negotiated.families().is_empty());
        assert_eq!(negotiated.decode_context().four_octet_as, Some(true));
    }

    #[test]
    fn test_negotiate_graceful_restart() {
        let global = global();
        let mut neighbor = neighbor();
        neighbor.graceful_restart.enabled = true;
        neighbor.graceful_restart.long_lived_enabled = true;
        let sent = build_open(&global, &neighbor, capabilities_from_config(&neighbor, ""));
        let (local, peer) = addrs();
        let gr = GracefulRestart {
            restarting: true,
            notification: true,
            restart_time: 60,
            tuples: vec![
                GracefulRestartTuple {
                    family: Family::IPV4_UNICAST,
                    forwarding: true,
                },
                GracefulRestartTuple {
                    family: Family::IPV6_UNICAST,
                    forwarding: true,
                },
            ],
        };
        let llgr = LongLivedGracefulRestart(vec![LlgrTuple {
            family: Family::IPV4_UNICAST,
            forwarding: true,
            stale_time: 3600,
        }]);
        let received = peer_open(
            65001,
            90,
            vec![
                Value::GracefulRestart(gr.clone()),
                Value::LongLivedGracefulRestart(llgr),
            ],
        );
        let negotiated = negotiate(&global, &neighbor, sent.clone(), received, local, peer);
        let state = negotiated.graceful_restart.unwrap();
        assert_eq!(state.restart_time, 60);
        // We did not enable notification
        assert!(!state.notification);
        assert!(state.forwarding(Family::IPV4_UNICAST));
        assert!(!state.forwarding(Family::IPV6_UNICAST));
        assert_eq!(state.stale_time(Family::IPV4_UNICAST), Some(3600));

        neighbor.graceful_restart.enabled = false;
        let received = peer_open(65001, 90, vec![Value::GracefulRestart(gr)]);
        let negotiated = negotiate(&global, &neighbor, sent, received, local, peer);
        assert!(negotiated.graceful_restart.is_none());
    }

    #[test]
    fn test_disable_family() {
        let global = global();
        let mut neighbor = neighbor();
        neighbor.afi_safis.push(AfiSafi::new(Family::IPV6_UNICAST));
        let sent = build_open(&global, &neighbor, capabilities_from_config(&neighbor, ""));
        let (local, peer) = addrs();
        let received = peer_open(
            65001,
            90,
            vec![
                Value::MultiProtocol(MultiProtocol::from(Family::IPV4_UNICAST)),
                Value::MultiProtocol(MultiProtocol::from(Family::IPV6_UNICAST)),
            ],
        );
        let negotiated = negotiate(&global, &neighbor, sent, received, local, peer);
        assert_eq!(negotiated.families().len(), 2);
        let disabled = negotiated.disable(&[Family::IPV6_UNICAST]);
        assert_eq!(disabled.families(), &[Family::IPV4_UNICAST]);
        assert_eq!(disabled.disabled, vec![Family::IPV6_UNICAST]);
        assert_eq!(disabled.send_options().families, vec![Family::IPV4_UNICAST]);
    }
}
