//! Per-peer BGP session state machine (RFC 4271 Section 8)
//!
//! Every configured neighbor gets one task that moves its session through
//! Idle, Active, OpenSent, OpenConfirm, and Established. The task reports
//! each transition and every batch of received paths to the server as an
//! [`FsmEvent`]. Other tasks only talk to it through an [`FsmHandle`].

// SPDX-License-Identifier: AGPL-3.0-or-later

mod counters;
mod handler;
pub mod negotiate;
mod outgoing;
#[cfg(test)]
mod tests;
pub mod timers;
mod transport;

pub use counters::{Counters, MessageCounts};
pub use timers::{AdminState, AdminStateOperation};

use crate::bgp::capability::{self, AddPathMode, GracefulRestartTuple, LlgrTuple};
use crate::bgp::{DecodeContext, Family, Notification, Open};
use crate::config::{Global, Neighbor};
use crate::table::{Path, SendOptions};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the event and outgoing message queues
pub const MESSAGE_QUEUE_LEN: usize = 1024;
const ACCEPT_QUEUE_LEN: usize = 1;
const CONTROL_QUEUE_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session with {0} has stopped")]
    Stopped(IpAddr),
    #[error("control queue of {0} is full")]
    Busy(IpAddr),
}

/// Session states
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FsmState {
    #[default]
    Idle,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::OpenSent => "opensent",
            Self::OpenConfirm => "openconfirm",
            Self::Established => "established",
        })
    }
}

/// Why a transition happened
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateReasonKind {
    Dying,
    AdminDown,
    ReadFailed,
    WriteFailed,
    NotificationSent,
    NotificationReceived,
    HoldTimerExpired,
    IdleTimerExpired,
    RestartTimerExpired,
    GracefulRestart,
    InvalidMsg,
    NewConnection,
    OpenMsgReceived,
    OpenMsgNegotiated,
    HardReset,
    Deconfigured,
    ConnectFailed,
}

impl fmt::Display for StateReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Dying => "dying",
            Self::AdminDown => "admin-down",
            Self::ReadFailed => "read-failed",
            Self::WriteFailed => "write-failed",
            Self::NotificationSent => "notification-sent",
            Self::NotificationReceived => "notification-received",
            Self::HoldTimerExpired => "hold-timer-expired",
            Self::IdleTimerExpired => "idle-timer-expired",
            Self::RestartTimerExpired => "restart-timer-expired",
            Self::GracefulRestart => "graceful-restart",
            Self::InvalidMsg => "invalid-msg",
            Self::NewConnection => "new-connection",
            Self::OpenMsgReceived => "open-msg-received",
            Self::OpenMsgNegotiated => "open-msg-negotiated",
            Self::HardReset => "hard-reset",
            Self::Deconfigured => "deconfigured",
            Self::ConnectFailed => "connect-failed",
        })
    }
}

/// Reason attached to a transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateReason {
    pub kind: StateReasonKind,
    /// The NOTIFICATION sent or received, if one caused the transition
    pub notification: Option<Notification>,
    pub detail: Option<String>,
}

impl StateReason {
    #[must_use]
    pub const fn new(kind: StateReasonKind) -> Self {
        Self {
            kind,
            notification: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.notification = Some(notification);
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(notification) = &self.notification {
            write!(f, " ({notification})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Identity of an established peer, shared by every path learned from it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub local_as: u32,
    pub peer_as: u32,
    pub local_id: Ipv4Addr,
    pub peer_id: Ipv4Addr,
    pub local_addr: IpAddr,
    pub peer_addr: IpAddr,
    /// Negotiated address families
    pub families: Vec<Family>,
    pub route_reflector_client: bool,
    pub cluster_id: Option<Ipv4Addr>,
    pub confederation_member: bool,
}

/// Graceful restart state agreed with the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiatedGracefulRestart {
    /// Restart time the peer advertised
    pub restart_time: u16,
    /// Both sides set the N bit (RFC 8538)
    pub notification: bool,
    /// Families the peer preserves state for, restricted to negotiated ones
    pub families: Vec<GracefulRestartTuple>,
    /// Long-lived stale times, empty unless both sides advertised LLGR
    pub long_lived: Vec<LlgrTuple>,
}

impl NegotiatedGracefulRestart {
    /// Check if the peer keeps forwarding `family` while restarting
    #[must_use]
    pub fn forwarding(&self, family: Family) -> bool {
        self.families
            .iter()
            .any(|tuple| tuple.family == family && tuple.forwarding)
    }

    /// Long-lived stale time of `family`, if negotiated
    #[must_use]
    pub fn stale_time(&self, family: Family) -> Option<u32> {
        self.long_lived
            .iter()
            .find(|tuple| tuple.family == family)
            .map(|tuple| tuple.stale_time)
    }
}

/// Everything agreed on by one OPEN exchange
#[derive(Clone, Debug, PartialEq)]
pub struct Negotiated {
    pub peer_info: Arc<PeerInfo>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub sent_open: Open,
    pub received_open: Open,
    /// Capabilities the peer advertised, by code
    pub capabilities: BTreeMap<u8, Vec<capability::Value>>,
    /// ADD-PATH directions in use, from our point of view
    pub add_path: BTreeMap<Family, AddPathMode>,
    pub hold_time: u16,
    pub keepalive_interval: u16,
    /// The peer lacks the four-octet AS capability
    pub two_byte_as: bool,
    /// The peer accepts ROUTE-REFRESH
    pub route_refresh: bool,
    pub graceful_restart: Option<NegotiatedGracefulRestart>,
    /// Families disabled after a malformed MP_REACH_NLRI or MP_UNREACH_NLRI
    pub disabled: Vec<Family>,
}

impl Negotiated {
    /// Families usable on this session
    #[must_use]
    pub fn families(&self) -> &[Family] {
        &self.peer_info.families
    }

    /// How to parse messages from the peer
    #[must_use]
    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            add_path_families: self
                .add_path
                .iter()
                .filter(|(_, mode)| mode.receive)
                .map(|(family, _)| *family)
                .collect(),
            four_octet_as: Some(!self.two_byte_as),
        }
    }

    /// How to build messages for the peer
    #[must_use]
    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            families: self.families().to_vec(),
            add_path_send: self
                .add_path
                .iter()
                .filter(|(_, mode)| mode.send)
                .map(|(family, _)| *family)
                .collect(),
            two_byte_as: self.two_byte_as,
        }
    }

    /// A copy with `families` taken out of the negotiated set
    #[must_use]
    pub fn disable(&self, families: &[Family]) -> Self {
        let mut peer_info = (*self.peer_info).clone();
        peer_info.families.retain(|family| !families.contains(family));
        let mut disabled = self.disabled.clone();
        for family in families {
            if !disabled.contains(family) {
                disabled.push(*family);
            }
        }
        Self {
            peer_info: Arc::new(peer_info),
            disabled,
            ..self.clone()
        }
    }
}

/// Message from a session task to the server
#[derive(Clone, Debug)]
pub enum FsmMsg {
    StateChange {
        old: FsmState,
        new: FsmState,
        reason: StateReason,
        admin_state: AdminState,
        /// The session being left or entered, if any
        negotiated: Option<Arc<Negotiated>>,
    },
    /// Paths received in one UPDATE, or an End-of-RIB marker
    Update {
        paths: Vec<Path>,
        eor: Option<Family>,
        timestamp: SystemTime,
    },
    /// The peer asked for our routes again
    RouteRefresh(Family),
}

#[derive(Clone, Debug)]
pub struct FsmEvent {
    pub neighbor: IpAddr,
    pub msg: FsmMsg,
}

/// Something to send to an established peer
#[derive(Clone, Debug)]
pub enum Outgoing {
    Paths(Vec<Path>),
    EndOfRib(Vec<Family>),
    RouteRefresh(Family),
    /// Send and close the session
    Notification(Notification),
}

/// Requests handled by the session task
#[derive(Clone, Debug)]
enum Control {
    Admin(AdminStateOperation),
    /// Hard reset with a shutdown communication
    Reset(String),
}

/// State, admin state, and reason, as last published
#[derive(Clone, Debug, Default)]
struct Status {
    state: FsmState,
    admin_state: AdminState,
    reason: Option<StateReason>,
}

/// State shared between the session tasks and the handle
#[derive(Debug)]
struct Shared {
    neighbor_address: IpAddr,
    global: Arc<Global>,
    config: RwLock<Neighbor>,
    status: watch::Sender<Status>,
    negotiated: watch::Sender<Option<Arc<Negotiated>>>,
    counters: Counters,
    deconfigured: AtomicBool,
}

impl Shared {
    /// Current configuration of the neighbor
    fn config(&self) -> Neighbor {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn negotiated(&self) -> Option<Arc<Negotiated>> {
        self.negotiated.borrow().clone()
    }
}

/// Snapshot of a session
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub state: FsmState,
    pub admin_state: AdminState,
    pub reason: Option<StateReason>,
    pub negotiated: Option<Arc<Negotiated>>,
    pub sent: MessageCounts,
    pub received: MessageCounts,
}

/// Owner's side of a session task
#[derive(Debug)]
pub struct FsmHandle {
    shared: Arc<Shared>,
    conn_tx: mpsc::Sender<TcpStream>,
    control_tx: mpsc::Sender<Control>,
    outgoing_tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FsmHandle {
    /// Start the session task of `neighbor`
    ///
    /// `neighbor` must already be validated. The task stops when `cancel`
    /// is cancelled.
    #[must_use]
    pub fn spawn(
        global: Arc<Global>,
        neighbor: Neighbor,
        events: mpsc::Sender<FsmEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let admin_state = if neighbor.admin_down {
            AdminState::Down
        } else {
            AdminState::Up
        };
        let (status, _) = watch::channel(Status {
            admin_state,
            ..Status::default()
        });
        let (negotiated, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            neighbor_address: neighbor.neighbor_address,
            global,
            config: RwLock::new(neighbor),
            status,
            negotiated,
            counters: Counters::default(),
            deconfigured: AtomicBool::new(false),
        });
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_LEN);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_LEN);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(MESSAGE_QUEUE_LEN);
        let handler = handler::Handler::new(
            Arc::clone(&shared),
            events,
            conn_rx,
            control_rx,
            outgoing_rx,
            cancel.clone(),
            admin_state,
        );
        let task = tokio::spawn(handler.run());
        Self {
            shared,
            conn_tx,
            control_tx,
            outgoing_tx,
            cancel,
            task,
        }
    }

    #[must_use]
    pub fn neighbor_address(&self) -> IpAddr {
        self.shared.neighbor_address
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let status = self.shared.status.borrow().clone();
        SessionStatus {
            state: status.state,
            admin_state: status.admin_state,
            reason: status.reason,
            negotiated: self.shared.negotiated(),
            sent: self.shared.counters.sent.snapshot(),
            received: self.shared.counters.received.snapshot(),
        }
    }

    /// The current session, if one got past OpenSent
    #[must_use]
    pub fn negotiated(&self) -> Option<Arc<Negotiated>> {
        self.shared.negotiated()
    }

    /// Current configuration of the neighbor
    #[must_use]
    pub fn config(&self) -> Neighbor {
        self.shared.config()
    }

    /// Replace the configuration, used from the next connection on
    pub fn update_config(&self, neighbor: Neighbor) {
        *self
            .shared
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = neighbor;
    }

    /// Hand over a connection accepted by the listener
    ///
    /// Gives the connection back if the session cannot take it now.
    pub fn pass_conn(&self, stream: TcpStream) -> Result<(), TcpStream> {
        self.conn_tx.try_send(stream).map_err(|e| match e {
            mpsc::error::TrySendError::Full(stream) | mpsc::error::TrySendError::Closed(stream) => {
                stream
            }
        })
    }

    pub fn set_admin_state(&self, op: AdminStateOperation) -> Result<(), Error> {
        self.control(Control::Admin(op))
    }

    /// Close the session with CEASE/Administrative Reset
    pub fn reset(&self, communication: &str) -> Result<(), Error> {
        self.control(Control::Reset(communication.to_string()))
    }

    fn control(&self, control: Control) -> Result<(), Error> {
        self.control_tx.try_send(control).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Busy(self.neighbor_address()),
            mpsc::error::TrySendError::Closed(_) => Error::Stopped(self.neighbor_address()),
        })
    }

    /// Queue something for the peer, waiting while the queue is full
    ///
    /// Anything queued while no session is established is dropped when the
    /// next session ends.
    pub async fn send(&self, outgoing: Outgoing) -> Result<(), Error> {
        self.outgoing_tx
            .send(outgoing)
            .await
            .map_err(|_| Error::Stopped(self.neighbor_address()))
    }

    /// The outgoing queue, for sending without holding on to the handle
    #[must_use]
    pub fn outgoing(&self) -> mpsc::Sender<Outgoing> {
        self.outgoing_tx.clone()
    }

    /// Stop the session because the neighbor was removed
    ///
    /// An established peer gets a CEASE/Peer De-configured first.
    pub fn deconfigure(&self) {
        self.shared.deconfigured.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Stop the session task and wait for it to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for the session task to finish
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::error!("{}: session task failed: {e}", self.shared.neighbor_address);
        }
    }
}
