//! Session scenarios against a scripted peer over loopback TCP

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::*;
use crate::bgp::capability::{
    AddPathMode, AddPathTuple, Capabilities, CapabilitiesBuilder, GracefulRestart,
    GracefulRestartTuple,
};
use crate::bgp::cidr::{Cidr, Cidr4, Cidr6};
use crate::bgp::path::{self, MpNextHop, PathAttributes};
use crate::bgp::tests::hex_to_bytes;
use crate::bgp::{
    CeaseSubcode, Codec, Message, NotificationErrorCode, OpenMessageErrorSubcode, Update,
};
use crate::config::AfiSafi;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::codec::Framed;

const WAIT: Duration = Duration::from_secs(10);

fn global() -> Global {
    Global {
        asn: 65000,
        router_id: Ipv4Addr::new(192, 0, 2, 1),
        ..Global::default()
    }
}

struct Setup {
    handle: FsmHandle,
    events: mpsc::Receiver<FsmEvent>,
    listener: TcpListener,
}

/// Start a session dialing a local listener
async fn setup(configure: impl FnOnce(&mut Neighbor)) -> Setup {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let global = global();
    let mut neighbor = Neighbor::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 65001);
    neighbor.transport.remote_port = port;
    configure(&mut neighbor);
    neighbor.validate(&global).unwrap();
    let (events_tx, events) = mpsc::channel(MESSAGE_QUEUE_LEN);
    let handle = FsmHandle::spawn(
        Arc::new(global),
        neighbor,
        events_tx,
        CancellationToken::new(),
    );
    Setup {
        handle,
        events,
        listener,
    }
}

/// Wait for a transition into `state` and return its reason
async fn wait_state(events: &mut mpsc::Receiver<FsmEvent>, state: FsmState) -> StateReason {
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let FsmMsg::StateChange { new, reason, .. } = event.msg {
            if new == state {
                return reason;
            }
        }
    }
}

/// Wait for the next batch of received paths or End-of-RIB
async fn wait_update(events: &mut mpsc::Receiver<FsmEvent>) -> (Vec<Path>, Option<Family>) {
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let FsmMsg::Update { paths, eor, .. } = event.msg {
            return (paths, eor);
        }
    }
}

struct Peer {
    framed: Framed<TcpStream, Codec>,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        Self {
            framed: Framed::new(stream, Codec::default()),
        }
    }

    fn open(asn: u32, hold_time: u16) -> Message {
        let caps = CapabilitiesBuilder::new()
            .mp_ipv4_unicast()
            .route_refresh()
            .four_octet_as_number(asn)
            .build();
        Self::open_with(asn, hold_time, caps)
    }

    fn open_with(asn: u32, hold_time: u16, caps: Capabilities) -> Message {
        Message::Open(Open::new_easy(
            asn,
            hold_time,
            Ipv4Addr::new(192, 0, 2, 2),
            caps,
        ))
    }

    async fn send(&mut self, message: Message) {
        self.framed.send(message).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        timeout(WAIT, self.framed.next())
            .await
            .unwrap()
            .map(Result::unwrap)
    }

    /// Next message other than KEEPALIVE
    async fn recv_skipping_keepalives(&mut self) -> Option<Message> {
        loop {
            match self.recv().await {
                Some(Message::Keepalive) => continue,
                other => return other,
            }
        }
    }

    /// Run the OPEN exchange, returning the OPEN of the session
    async fn handshake(&mut self, hold_time: u16) -> Open {
        self.handshake_with(Self::open(65001, hold_time)).await
    }

    async fn handshake_with(&mut self, open: Message) -> Open {
        self.send(open).await;
        let Some(Message::Open(open)) = self.recv().await else {
            panic!("expected OPEN");
        };
        self.send(Message::Keepalive).await;
        assert_eq!(self.recv().await, Some(Message::Keepalive));
        open
    }
}

async fn established(configure: impl FnOnce(&mut Neighbor), hold_time: u16) -> (Setup, Peer) {
    established_with(configure, Peer::open(65001, hold_time)).await
}

async fn established_with(configure: impl FnOnce(&mut Neighbor), open: Message) -> (Setup, Peer) {
    let mut setup = setup(configure).await;
    let mut peer = Peer::accept(&setup.listener).await;
    peer.handshake_with(open).await;
    wait_state(&mut setup.events, FsmState::Established).await;
    (setup, peer)
}

#[tokio::test]
async fn test_full_handshake() {
    let mut setup = setup(|_| {}).await;
    let reason = wait_state(&mut setup.events, FsmState::Active).await;
    assert_eq!(reason.kind, StateReasonKind::IdleTimerExpired);
    let mut peer = Peer::accept(&setup.listener).await;
    let open = peer.handshake(30).await;
    assert_eq!(open.asn, 65000);
    assert_eq!(open.hold_time, 90);
    assert_eq!(open.four_octet_asn(), Some(65000));

    let reason = wait_state(&mut setup.events, FsmState::Established).await;
    assert_eq!(reason.kind, StateReasonKind::OpenMsgNegotiated);
    let status = setup.handle.status();
    assert_eq!(status.state, FsmState::Established);
    assert_eq!(status.admin_state, AdminState::Up);
    let negotiated = status.negotiated.unwrap();
    assert_eq!(negotiated.hold_time, 30);
    assert_eq!(negotiated.keepalive_interval, 10);
    assert!(!negotiated.two_byte_as);
    assert_eq!(negotiated.peer_info.peer_as, 65001);
    assert_eq!(negotiated.families(), &[Family::IPV4_UNICAST]);
    assert_eq!(status.sent.open, 1);
    assert!(status.received.keepalive >= 1);

    setup.handle.stop().await;
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn test_routes_both_ways() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;

    // Outgoing
    let attributes = Arc::new(PathAttributes(vec![
        path::Value {
            flags: path::Flags::WELL_KNOWN_COMPLETE,
            data: path::Data::Origin(path::Origin::Igp),
        },
        path::Value {
            flags: path::Flags::WELL_KNOWN_COMPLETE,
            data: path::Data::AsPath(path::AsPath::default()),
        },
    ]));
    let prefix = Cidr4::new(Ipv4Addr::new(198, 51, 100, 0), 24);
    let next_hop = MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    let paths = vec![
        Path::new(Family::IPV4_UNICAST, prefix.into(), Arc::clone(&attributes), next_hop),
        // Not negotiated, dropped
        Path::new(
            Family::IPV6_UNICAST,
            Cidr6::new("2001:db8::".parse().unwrap(), 32).into(),
            Arc::clone(&attributes),
            next_hop,
        ),
    ];
    setup.handle.send(Outgoing::Paths(paths)).await.unwrap();
    setup
        .handle
        .send(Outgoing::EndOfRib(vec![Family::IPV4_UNICAST, Family::IPV6_UNICAST]))
        .await
        .unwrap();
    let Some(Message::Update(update)) = peer.recv_skipping_keepalives().await else {
        panic!("expected UPDATE");
    };
    assert_eq!(update.nlri.len(), 1);
    assert!(update.path_attributes.get(path::Type::NextHop).is_some());
    let Some(Message::Update(eor)) = peer.recv_skipping_keepalives().await else {
        panic!("expected End-of-RIB");
    };
    assert_eq!(eor.end_of_rib_family(), Some(Family::IPV4_UNICAST));

    // Incoming
    let as_path = path::Value {
        flags: path::Flags::WELL_KNOWN_COMPLETE,
        data: path::Data::AsPath(path::AsPath(vec![path::AsSegment {
            type_: path::AsSegmentType::AsSequence,
            asns: vec![65001, 65000],
            as4: true,
        }])),
    };
    let update = crate::bgp::UpdateBuilder::new(false)
        .add_route(Cidr::V4(prefix))
        .set_origin(path::Origin::Igp)
        .set_next_hop(MpNextHop::Single(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))))
        .path_attribute(as_path)
        .build()
        .unwrap()
        .remove(0);
    peer.send(Message::Update(update)).await;
    let (paths, eor) = wait_update(&mut setup.events).await;
    assert_eq!(eor, None);
    assert_eq!(paths.len(), 1);
    assert!(!paths[0].withdrawal);
    // Our own AS is in the path
    assert!(paths[0].rejected);
    assert_eq!(paths[0].source.as_ref().unwrap().peer_as, 65001);

    peer.send(Message::Update(Update::end_of_rib(Family::IPV4_UNICAST)))
        .await;
    let (paths, eor) = wait_update(&mut setup.events).await;
    assert!(paths.is_empty());
    assert_eq!(eor, Some(Family::IPV4_UNICAST));

    peer.send(Message::RouteRefresh(crate::bgp::RouteRefresh::new(
        Family::IPV4_UNICAST,
    )))
    .await;
    loop {
        let event = timeout(WAIT, setup.events.recv()).await.unwrap().unwrap();
        if let FsmMsg::RouteRefresh(family) = event.msg {
            assert_eq!(family, Family::IPV4_UNICAST);
            break;
        }
    }
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_hold_timer_expiry() {
    let (mut setup, mut peer) = established(|_| {}, 3).await;
    assert_eq!(setup.handle.status().negotiated.unwrap().keepalive_interval, 1);
    // Stay silent until the session gives up
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(notification.error_code, NotificationErrorCode::HoldTimerExpired);
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::HoldTimerExpired);
    assert_eq!(reason.notification, Some(notification));
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_admin_down_established() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;
    setup
        .handle
        .set_admin_state(AdminStateOperation::new(AdminState::Down, "maintenance"))
        .unwrap();
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(notification.error_code, NotificationErrorCode::Cease);
    assert_eq!(
        notification.error_subcode,
        CeaseSubcode::AdministrativeShutdown as u8
    );
    assert_eq!(notification.communication().as_deref(), Some("maintenance"));
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::AdminDown);
    assert_eq!(setup.handle.status().admin_state, AdminState::Down);
    assert_eq!(peer.recv().await, None);

    // Stays down until enabled again
    assert!(timeout(Duration::from_millis(500), setup.listener.accept())
        .await
        .is_err());
    setup
        .handle
        .set_admin_state(AdminStateOperation::new(AdminState::Up, ""))
        .unwrap();
    wait_state(&mut setup.events, FsmState::Active).await;
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_admin_down_active() {
    let mut setup = setup(|neighbor| neighbor.transport.passive_mode = true).await;
    wait_state(&mut setup.events, FsmState::Active).await;
    setup
        .handle
        .set_admin_state(AdminStateOperation::new(AdminState::Down, ""))
        .unwrap();
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::AdminDown);
    assert_eq!(reason.notification, None);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_admin_down_open_sent() {
    let mut setup = setup(|_| {}).await;
    let mut peer = Peer::accept(&setup.listener).await;
    assert!(matches!(peer.recv().await, Some(Message::Open(_))));
    wait_state(&mut setup.events, FsmState::OpenSent).await;
    setup
        .handle
        .set_admin_state(AdminStateOperation::new(AdminState::Down, ""))
        .unwrap();
    let Some(Message::Notification(notification)) = peer.recv().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(
        notification.error_subcode,
        CeaseSubcode::AdministrativeShutdown as u8
    );
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::AdminDown);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_admin_down_open_confirm() {
    let mut setup = setup(|_| {}).await;
    let mut peer = Peer::accept(&setup.listener).await;
    peer.send(Peer::open(65001, 90)).await;
    assert!(matches!(peer.recv().await, Some(Message::Open(_))));
    assert_eq!(peer.recv().await, Some(Message::Keepalive));
    wait_state(&mut setup.events, FsmState::OpenConfirm).await;
    setup
        .handle
        .set_admin_state(AdminStateOperation::new(AdminState::Down, ""))
        .unwrap();
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(notification.error_code, NotificationErrorCode::Cease);
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::AdminDown);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_bad_peer_as() {
    let mut setup = setup(|_| {}).await;
    let mut peer = Peer::accept(&setup.listener).await;
    peer.send(Peer::open(65002, 90)).await;
    assert!(matches!(peer.recv().await, Some(Message::Open(_))));
    let Some(Message::Notification(notification)) = peer.recv().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(notification.error_code, NotificationErrorCode::OpenMessageError);
    assert_eq!(
        notification.error_subcode,
        OpenMessageErrorSubcode::BadPeerAs as u8
    );
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::InvalidMsg);
    setup.handle.stop().await;
}

/// UPDATE with ORIGIN 5 for 198.51.100.0/24
const BAD_ORIGIN_UPDATE: &str = "ffffffffffffffffffffffffffffffff 0029 02
    0000 000e 400101 05 400200 400304 c0000202 18c63364";

#[tokio::test]
async fn test_treat_as_withdraw() {
    let (mut setup, mut peer) = established(
        |neighbor| neighbor.error_handling.treat_as_withdraw = true,
        90,
    )
    .await;
    peer.framed
        .get_mut()
        .write_all(&hex_to_bytes(BAD_ORIGIN_UPDATE))
        .await
        .unwrap();
    let (paths, _) = wait_update(&mut setup.events).await;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].withdrawal);
    let status = setup.handle.status();
    assert_eq!(status.state, FsmState::Established);
    assert_eq!(status.received.discarded, 1);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_malformed_update_resets() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;
    peer.framed
        .get_mut()
        .write_all(&hex_to_bytes(BAD_ORIGIN_UPDATE))
        .await
        .unwrap();
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(
        notification.error_code,
        NotificationErrorCode::UpdateMessageError
    );
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::InvalidMsg);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_connection_outside_active_closed() {
    let (setup, _peer) = established(|_| {}, 90).await;
    let extra = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut client = TcpStream::connect(extra.local_addr().unwrap())
        .await
        .unwrap();
    let (accepted, _) = extra.accept().await.unwrap();
    assert!(setup.handle.pass_conn(accepted).is_ok());
    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(setup.handle.status().state, FsmState::Established);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_reset() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;
    setup.handle.reset("configuration change").unwrap();
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(
        notification.error_subcode,
        CeaseSubcode::AdministrativeReset as u8
    );
    assert_eq!(
        notification.communication().as_deref(),
        Some("configuration change")
    );
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::HardReset);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_deconfigure() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;
    setup.handle.deconfigure();
    let Some(Message::Notification(notification)) = peer.recv_skipping_keepalives().await else {
        panic!("expected NOTIFICATION");
    };
    assert_eq!(
        notification.error_subcode,
        CeaseSubcode::PeerDeconfigured as u8
    );
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::Deconfigured);
    setup.handle.join().await;
}

#[tokio::test]
async fn test_connect_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut setup = setup(|neighbor| neighbor.transport.remote_port = port).await;
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::ConnectFailed);
    assert!(reason.detail.is_some());
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_peer_notification() {
    let (mut setup, mut peer) = established(|_| {}, 90).await;
    let cease = Notification::cease(CeaseSubcode::AdministrativeShutdown, "bye");
    peer.send(Message::Notification(cease.clone())).await;
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::NotificationReceived);
    assert_eq!(reason.notification, Some(cease));
    assert!(setup.handle.status().negotiated.is_none());
    setup.handle.stop().await;
}

/// UPDATE for 198.51.100.0/24 with path identifier 1 and a four-octet AS_PATH
const ADD_PATH_UPDATE: &str = "ffffffffffffffffffffffffffffffff 0033 02
    0000 0014 400101 00 400206 0201 0000fde9 400304 c0000202
    00000001 18c63364";

#[tokio::test]
async fn test_add_path_receive_pipelined_open() {
    let mut setup = setup(|neighbor| {
        let mut afi_safi = AfiSafi::new(Family::IPV4_UNICAST);
        afi_safi.add_paths.receive = true;
        neighbor.afi_safis.push(afi_safi);
    })
    .await;
    let caps = CapabilitiesBuilder::new()
        .mp_ipv4_unicast()
        .four_octet_as_number(65001)
        .add_path(vec![AddPathTuple {
            family: Family::IPV4_UNICAST,
            mode: AddPathMode {
                receive: false,
                send: true,
            },
        }])
        .build();
    let mut peer = Peer::accept(&setup.listener).await;
    // OPEN and KEEPALIVE arrive together
    peer.framed
        .feed(Peer::open_with(65001, 90, caps))
        .await
        .unwrap();
    peer.framed.feed(Message::Keepalive).await.unwrap();
    peer.framed.flush().await.unwrap();
    assert!(matches!(peer.recv().await, Some(Message::Open(_))));
    assert_eq!(peer.recv().await, Some(Message::Keepalive));
    wait_state(&mut setup.events, FsmState::Established).await;
    let negotiated = setup.handle.negotiated().unwrap();
    assert!(negotiated.add_path[&Family::IPV4_UNICAST].receive);

    peer.framed
        .get_mut()
        .write_all(&hex_to_bytes(ADD_PATH_UPDATE))
        .await
        .unwrap();
    let (paths, _) = wait_update(&mut setup.events).await;
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].nlri.path_id, Some(1));
    assert_eq!(paths[0].nlri.prefix_len, 24);
    assert!(!paths[0].withdrawal);
    assert_eq!(setup.handle.status().state, FsmState::Established);
    setup.handle.stop().await;
}

/// UPDATE with an MP_REACH_NLRI for IPv6 unicast cut short in its next hop
const BAD_MP_REACH_UPDATE: &str = "ffffffffffffffffffffffffffffffff 0026 02
    0000 000f 400101 00 400200 800e05 0002 01 10 00";

/// UPDATE for 198.51.100.0/24 with a four-octet AS_PATH
const IPV4_UPDATE: &str = "ffffffffffffffffffffffffffffffff 002f 02
    0000 0014 400101 00 400206 0201 0000fde9 400304 c0000202 18c63364";

#[tokio::test]
async fn test_malformed_mp_reach_disables_family() {
    let caps = CapabilitiesBuilder::new()
        .mp_ipv4_unicast()
        .mp_ipv6_unicast()
        .four_octet_as_number(65001)
        .build();
    let (mut setup, mut peer) = established_with(
        |neighbor| {
            neighbor.error_handling.treat_as_withdraw = true;
            neighbor.afi_safis = vec![
                AfiSafi::new(Family::IPV4_UNICAST),
                AfiSafi::new(Family::IPV6_UNICAST),
            ];
        },
        Peer::open_with(65001, 90, caps),
    )
    .await;
    assert_eq!(
        setup.handle.negotiated().unwrap().families(),
        &[Family::IPV4_UNICAST, Family::IPV6_UNICAST]
    );
    let stream = peer.framed.get_mut();
    stream
        .write_all(&hex_to_bytes(BAD_MP_REACH_UPDATE))
        .await
        .unwrap();
    stream.write_all(&hex_to_bytes(IPV4_UPDATE)).await.unwrap();
    // Messages are handled in order, so the family is gone by now
    let (paths, _) = wait_update(&mut setup.events).await;
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].family, Family::IPV4_UNICAST);
    let status = setup.handle.status();
    assert_eq!(status.state, FsmState::Established);
    let negotiated = status.negotiated.unwrap();
    assert_eq!(negotiated.families(), &[Family::IPV4_UNICAST]);
    assert_eq!(negotiated.disabled, vec![Family::IPV6_UNICAST]);
    setup.handle.stop().await;
}

#[tokio::test]
async fn test_graceful_restart_then_restart_timer() {
    let caps = CapabilitiesBuilder::new()
        .mp_ipv4_unicast()
        .four_octet_as_number(65001)
        .graceful_restart(GracefulRestart {
            restarting: false,
            notification: false,
            restart_time: 1,
            tuples: vec![GracefulRestartTuple {
                family: Family::IPV4_UNICAST,
                forwarding: true,
            }],
        })
        .build();
    let (mut setup, peer) = established_with(
        |neighbor| neighbor.graceful_restart.enabled = true,
        Peer::open_with(65001, 90, caps),
    )
    .await;
    assert!(setup
        .handle
        .negotiated()
        .unwrap()
        .graceful_restart
        .is_some());

    // The peer goes away without a NOTIFICATION
    drop(peer);
    let reason = wait_state(&mut setup.events, FsmState::Idle).await;
    assert_eq!(reason.kind, StateReasonKind::GracefulRestart);
    loop {
        let event = timeout(WAIT, setup.events.recv()).await.unwrap().unwrap();
        if let FsmMsg::StateChange { new, reason, .. } = event.msg {
            if reason.kind == StateReasonKind::RestartTimerExpired {
                assert_eq!(new, FsmState::Idle);
                break;
            }
            assert_ne!(new, FsmState::Established);
        }
    }
    setup.handle.stop().await;
}

/// UPDATE from a two-octet AS speaker for 198.51.100.0/24:
/// AS_PATH 65001 23456 and AS4_PATH 65001 4200000000
const AS4_PATH_UPDATE: &str = "ffffffffffffffffffffffffffffffff 003c 02
    0000 0021 400101 00 400206 0202 fde9 5ba0 400304 c0000202
    c0110a 0202 0000fde9 fa56ea00
    18c63364";

#[tokio::test]
async fn test_two_octet_as_peer() {
    let caps = CapabilitiesBuilder::new().mp_ipv4_unicast().build();
    let (mut setup, mut peer) =
        established_with(|_| {}, Peer::open_with(65001, 90, caps)).await;
    assert!(setup.handle.negotiated().unwrap().two_byte_as);
    peer.framed
        .get_mut()
        .write_all(&hex_to_bytes(AS4_PATH_UPDATE))
        .await
        .unwrap();
    let (paths, _) = wait_update(&mut setup.events).await;
    assert_eq!(paths.len(), 1);
    let attributes = &paths[0].attributes;
    assert!(attributes.get(path::Type::As4Path).is_none());
    let as_path = attributes.as_path().unwrap();
    let asns: Vec<u32> = as_path
        .iter()
        .flat_map(|segment| segment.asns.iter().copied())
        .collect();
    assert_eq!(asns, vec![65001, 4_200_000_000]);
    assert!(!paths[0].rejected);
    setup.handle.stop().await;
}
