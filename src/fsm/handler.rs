//! State handlers of the session task

// SPDX-License-Identifier: AGPL-3.0-or-later

use super::outgoing::{self, Pump, PumpExit};
use super::timers::{
    self, AdminState, Timer, DEFAULT_IDLE_HOLD_TIME, INITIAL_IDLE_HOLD_TIME, OPEN_SENT_HOLD_TIME,
};
use super::transport::{self, Inbound, Writer};
use super::{
    negotiate, Control, FsmEvent, FsmMsg, FsmState, Negotiated, NegotiatedGracefulRestart,
    Outgoing, Shared, StateReason, StateReasonKind, MESSAGE_QUEUE_LEN,
};
use crate::bgp::{
    CeaseSubcode, Codec, Error, FsmErrorSubcode, MalformedUpdate, Message, Notification,
    NotificationErrorCode, RouteRefresh, Treatment, Update,
};
use crate::config::Neighbor;
use crate::table;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Time given to the pump to write a final NOTIFICATION
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Transition = (FsmState, StateReason);
type PumpResult = Result<(mpsc::Receiver<Outgoing>, PumpExit), JoinError>;

/// A connection that got past Active
struct Session {
    /// Taken by the pump in Established
    writer: Option<Writer>,
    inbound_rx: mpsc::Receiver<Inbound>,
    /// Stops the receive task and the pump
    token: CancellationToken,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

/// How the Established loop ends
enum Exit {
    /// Close without telling the peer
    Now(StateReason),
    /// Send a NOTIFICATION first
    Notify(Notification, StateReason),
    /// The pump stopped on its own
    Pump(PumpResult),
}

pub(super) struct Handler {
    shared: Arc<Shared>,
    events: mpsc::Sender<FsmEvent>,
    conn_rx: mpsc::Receiver<TcpStream>,
    control_rx: mpsc::Receiver<Control>,
    /// Lent to the pump while Established
    outgoing_rx: Option<mpsc::Receiver<Outgoing>>,
    cancel: CancellationToken,
    state: FsmState,
    admin_state: AdminState,
    idle_hold_time: Duration,
    /// Runs while the peer is restarting
    restart_timer: Timer,
    conn: Option<TcpStream>,
    session: Option<Session>,
}

impl Handler {
    pub(super) fn new(
        shared: Arc<Shared>,
        events: mpsc::Sender<FsmEvent>,
        conn_rx: mpsc::Receiver<TcpStream>,
        control_rx: mpsc::Receiver<Control>,
        outgoing_rx: mpsc::Receiver<Outgoing>,
        cancel: CancellationToken,
        admin_state: AdminState,
    ) -> Self {
        Self {
            shared,
            events,
            conn_rx,
            control_rx,
            outgoing_rx: Some(outgoing_rx),
            cancel,
            state: FsmState::Idle,
            admin_state,
            idle_hold_time: INITIAL_IDLE_HOLD_TIME,
            restart_timer: Timer::default(),
            conn: None,
            session: None,
        }
    }

    pub(super) async fn run(mut self) {
        let addr = self.shared.neighbor_address;
        log::debug!("{addr}: session task started");
        loop {
            let (next, reason) = match self.state {
                FsmState::Idle => self.idle().await,
                FsmState::Active => self.active().await,
                FsmState::OpenSent => self.open_sent().await,
                FsmState::OpenConfirm => self.open_confirm().await,
                FsmState::Established => self.established().await,
            };
            let done = matches!(
                reason.kind,
                StateReasonKind::Dying | StateReasonKind::Deconfigured
            );
            self.transition(next, reason).await;
            if done {
                break;
            }
        }
        log::debug!("{addr}: session task stopped");
    }

    async fn transition(&mut self, next: FsmState, mut reason: StateReason) {
        let addr = self.shared.neighbor_address;
        let old = self.state;
        let negotiated = self.shared.negotiated();
        if old == FsmState::Established && next != FsmState::Established {
            let gr = negotiated
                .as_ref()
                .and_then(|negotiated| negotiated.graceful_restart.as_ref());
            if let Some(gr) = gr.filter(|gr| graceful_restart_applies(gr, &reason)) {
                reason.kind = StateReasonKind::GracefulRestart;
                self.restart_timer
                    .arm(Duration::from_secs(u64::from(gr.restart_time)));
            }
        }
        if next == FsmState::Idle {
            self.close_session();
            self.shared.negotiated.send_replace(None);
        }
        log::info!("{addr}: {old} -> {next} ({reason})");
        self.state = next;
        let admin_state = self.admin_state;
        self.shared.status.send_modify(|status| {
            status.state = next;
            status.admin_state = admin_state;
            status.reason = Some(reason.clone());
        });
        self.emit(FsmMsg::StateChange {
            old,
            new: next,
            reason,
            admin_state,
            negotiated,
        })
        .await;
    }

    async fn emit(&self, msg: FsmMsg) {
        let event = FsmEvent {
            neighbor: self.shared.neighbor_address,
            msg,
        };
        if self.events.send(event).await.is_err() {
            log::debug!("{}: nobody listens to events", self.shared.neighbor_address);
        }
    }

    fn close_session(&mut self) {
        self.conn = None;
        if let Some(session) = self.session.take() {
            session.token.cancel();
        }
    }

    fn dying(&self) -> Transition {
        let kind = if self.shared.deconfigured.load(Ordering::Acquire) {
            StateReasonKind::Deconfigured
        } else {
            StateReasonKind::Dying
        };
        (FsmState::Idle, StateReason::new(kind))
    }

    fn restart_timer_expired(&self) -> Transition {
        log::warn!(
            "{}: peer did not come back within its restart time",
            self.shared.neighbor_address
        );
        (
            FsmState::Idle,
            StateReason::new(StateReasonKind::RestartTimerExpired),
        )
    }

    fn reject(&self, stream: TcpStream) {
        let from = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
        log::warn!(
            "{}: closing connection from {from} accepted in {}",
            self.shared.neighbor_address,
            self.state
        );
    }

    /// Apply an administrative request
    ///
    /// Returns the NOTIFICATION to close a connected session with, if the
    /// session has to go down.
    fn apply_control(&mut self, control: Control) -> Option<(Notification, StateReason)> {
        let addr = self.shared.neighbor_address;
        match control {
            Control::Admin(op) => {
                if op.state == self.admin_state {
                    log::debug!("{addr}: already {}", op.state);
                    return None;
                }
                log::info!("{addr}: admin state {} -> {}", self.admin_state, op.state);
                self.admin_state = op.state;
                self.shared
                    .status
                    .send_modify(|status| status.admin_state = op.state);
                let subcode = match op.state {
                    AdminState::Up => return None,
                    AdminState::Down => CeaseSubcode::AdministrativeShutdown,
                    AdminState::PfxCt => CeaseSubcode::MaximumNumberOfPrefixesReached,
                };
                Some((
                    Notification::cease(subcode, &op.communication),
                    StateReason::new(StateReasonKind::AdminDown),
                ))
            }
            Control::Reset(communication) => {
                let after_reset = self.shared.config().timers.idle_hold_time_after_reset;
                log::info!("{addr}: hard reset, next attempt in {after_reset}s");
                self.idle_hold_time = Duration::from_secs(after_reset);
                Some((
                    Notification::cease(CeaseSubcode::AdministrativeReset, &communication),
                    StateReason::new(StateReasonKind::HardReset),
                ))
            }
        }
    }

    /// Write a message on the connection of the current session
    async fn write(&mut self, message: Message, deadline: Option<Duration>) -> io::Result<()> {
        let Some(writer) = self
            .session
            .as_mut()
            .and_then(|session| session.writer.as_mut())
        else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no connection"));
        };
        outgoing::write_message(writer, message, deadline, &self.shared.counters.sent).await
    }

    fn write_deadline(&self) -> Option<Duration> {
        self.shared.negotiated().map_or(Some(OPEN_SENT_HOLD_TIME), |negotiated| {
            outgoing::write_deadline(negotiated.hold_time)
        })
    }

    /// Send a NOTIFICATION before Established and go to Idle
    async fn notify(&mut self, notification: Notification, reason: StateReason) -> Transition {
        let addr = self.shared.neighbor_address;
        log::warn!("{addr}: sending {notification}");
        let deadline = self.write_deadline();
        if let Err(e) = self
            .write(Message::Notification(notification.clone()), deadline)
            .await
        {
            log::debug!("{addr}: cannot send NOTIFICATION: {e}");
        }
        (FsmState::Idle, reason.with_notification(notification))
    }

    /// Reset the session because of a message we cannot accept
    async fn invalid(&mut self, error: Error) -> Transition {
        log::warn!("{}: {error}", self.shared.neighbor_address);
        let reason = StateReason::new(StateReasonKind::InvalidMsg).with_detail(&error);
        match error.notification() {
            Some(notification) => self.notify(notification, reason).await,
            None => (FsmState::Idle, reason),
        }
    }

    /// Reset the session because of a message not allowed in this state
    async fn unexpected(&mut self, subcode: FsmErrorSubcode, message: &str) -> Transition {
        let notification = fsm_error(subcode);
        let reason = StateReason::new(StateReasonKind::InvalidMsg)
            .with_detail(format!("unexpected {message} in {}", self.state));
        self.notify(notification, reason).await
    }

    async fn idle(&mut self) -> Transition {
        let mut idle_hold = Timer::default();
        if self.admin_state == AdminState::Up {
            idle_hold.arm(self.idle_hold_time);
        }
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.dying(),
                Some(stream) = self.conn_rx.recv() => self.reject(stream),
                () = self.restart_timer.expired() => return self.restart_timer_expired(),
                Some(control) = self.control_rx.recv() => {
                    let was_up = self.admin_state == AdminState::Up;
                    let hold_time = self.idle_hold_time;
                    // Nothing to notify without a connection
                    let _ = self.apply_control(control);
                    if self.admin_state != AdminState::Up {
                        idle_hold.disarm();
                    } else if !was_up || hold_time != self.idle_hold_time {
                        idle_hold.arm(self.idle_hold_time);
                    }
                }
                () = idle_hold.expired() => {
                    self.idle_hold_time = DEFAULT_IDLE_HOLD_TIME;
                    return (
                        FsmState::Active,
                        StateReason::new(StateReasonKind::IdleTimerExpired),
                    );
                }
            }
        }
    }

    async fn active(&mut self) -> Transition {
        let config = self.shared.config();
        let passive = config.transport.passive_mode;
        let dial = transport::dial(&config);
        tokio::pin!(dial);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.dying(),
                () = self.restart_timer.expired() => return self.restart_timer_expired(),
                Some(control) = self.control_rx.recv() => {
                    if let Some((_, reason)) = self.apply_control(control) {
                        return (FsmState::Idle, reason);
                    }
                }
                Some(stream) = self.conn_rx.recv() => {
                    self.conn = Some(stream);
                    return (
                        FsmState::OpenSent,
                        StateReason::new(StateReasonKind::NewConnection).with_detail("incoming"),
                    );
                }
                result = &mut dial, if !passive => match result {
                    Ok(stream) => {
                        self.conn = Some(stream);
                        return (
                            FsmState::OpenSent,
                            StateReason::new(StateReasonKind::NewConnection)
                                .with_detail("outgoing"),
                        );
                    }
                    Err(e) => {
                        self.idle_hold_time = Duration::from_secs(config.timers.connect_retry);
                        return (
                            FsmState::Idle,
                            StateReason::new(StateReasonKind::ConnectFailed).with_detail(e),
                        );
                    }
                },
            }
        }
    }

    /// Set up the receive task and writer of a new connection
    fn start_session(&mut self, stream: TcpStream, config: &Neighbor) -> io::Result<()> {
        transport::configure(&stream, config);
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        log::debug!(
            "{}: connected {local_addr} -> {peer_addr}",
            self.shared.neighbor_address
        );
        let (reader, writer) = stream.into_split();
        // Not a child of `cancel`: a closing session may still write its NOTIFICATION
        let token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_QUEUE_LEN);
        tokio::spawn(transport::receive(
            reader,
            Arc::clone(&self.shared),
            inbound_tx,
            token.clone(),
        ));
        self.session = Some(Session {
            writer: Some(FramedWrite::new(writer, Codec::default())),
            inbound_rx,
            token,
            local_addr,
            peer_addr,
        });
        Ok(())
    }

    async fn open_sent(&mut self) -> Transition {
        let Some(stream) = self.conn.take() else {
            return (
                FsmState::Idle,
                StateReason::new(StateReasonKind::ReadFailed).with_detail("no connection"),
            );
        };
        let config = self.shared.config();
        let global = Arc::clone(&self.shared.global);
        if let Err(e) = self.start_session(stream, &config) {
            return (
                FsmState::Idle,
                StateReason::new(StateReasonKind::ReadFailed).with_detail(e),
            );
        }
        let capabilities =
            negotiate::capabilities_from_config(&config, &negotiate::local_hostname());
        let sent_open = negotiate::build_open(&global, &config, capabilities);
        if let Err(e) = self
            .write(Message::Open(sent_open.clone()), Some(OPEN_SENT_HOLD_TIME))
            .await
        {
            return (
                FsmState::Idle,
                StateReason::new(StateReasonKind::WriteFailed).with_detail(e),
            );
        }
        let mut hold = Timer::armed(OPEN_SENT_HOLD_TIME);
        loop {
            let inbound = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.dying(),
                Some(control) = self.control_rx.recv() => {
                    if let Some((notification, reason)) = self.apply_control(control) {
                        return self.notify(notification, reason).await;
                    }
                    continue;
                }
                Some(stream) = self.conn_rx.recv() => {
                    self.reject(stream);
                    continue;
                }
                () = self.restart_timer.expired() => return self.restart_timer_expired(),
                () = hold.expired() => {
                    let reason = StateReason::new(StateReasonKind::HoldTimerExpired);
                    return self.notify(hold_timer_expired(), reason).await;
                }
                inbound = recv_inbound(&mut self.session) => inbound,
            };
            let message = match inbound {
                None => return read_failed("receive task stopped"),
                Some(Inbound::Closed(e)) => return read_failed(e),
                Some(Inbound::Invalid(e)) => return self.invalid(e).await,
                Some(Inbound::Malformed(_)) => {
                    return self
                        .unexpected(FsmErrorSubcode::UnexpectedInOpenSent, "UPDATE")
                        .await;
                }
                Some(Inbound::Message(message)) => message,
            };
            let open = match message {
                Message::Open(open) => open,
                Message::Notification(notification) => {
                    return notification_received(notification);
                }
                other => {
                    let name = message_name(&other);
                    return self
                        .unexpected(FsmErrorSubcode::UnexpectedInOpenSent, name)
                        .await;
                }
            };
            if let Err(notification) = negotiate::validate_open(&open, &global, &config) {
                let reason = StateReason::new(StateReasonKind::InvalidMsg).with_detail("bad OPEN");
                return self.notify(notification, reason).await;
            }
            let Some((local_addr, peer_addr)) = self
                .session
                .as_ref()
                .map(|session| (session.local_addr, session.peer_addr))
            else {
                return read_failed("no connection");
            };
            let negotiated = negotiate::negotiate(
                &global,
                &config,
                sent_open,
                open,
                local_addr,
                peer_addr,
            );
            log::debug!(
                "{}: negotiated hold time {}, keepalive {}, families {:?}",
                self.shared.neighbor_address,
                negotiated.hold_time,
                negotiated.keepalive_interval,
                negotiated.families()
            );
            let deadline = outgoing::write_deadline(negotiated.hold_time);
            self.shared
                .negotiated
                .send_replace(Some(Arc::new(negotiated)));
            if let Err(e) = self.write(Message::Keepalive, deadline).await {
                return (
                    FsmState::Idle,
                    StateReason::new(StateReasonKind::WriteFailed).with_detail(e),
                );
            }
            return (
                FsmState::OpenConfirm,
                StateReason::new(StateReasonKind::OpenMsgReceived),
            );
        }
    }

    async fn open_confirm(&mut self) -> Transition {
        let Some(negotiated) = self.shared.negotiated() else {
            return read_failed("no negotiated session");
        };
        let deadline = outgoing::write_deadline(negotiated.hold_time);
        let mut keepalive = timers::keepalive_ticker(negotiated.keepalive_interval);
        let mut hold = timers::hold_timer(negotiated.hold_time);
        loop {
            let inbound = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.dying(),
                Some(control) = self.control_rx.recv() => {
                    if let Some((notification, reason)) = self.apply_control(control) {
                        return self.notify(notification, reason).await;
                    }
                    continue;
                }
                Some(stream) = self.conn_rx.recv() => {
                    self.reject(stream);
                    continue;
                }
                () = self.restart_timer.expired() => return self.restart_timer_expired(),
                () = hold.expired() => {
                    let reason = StateReason::new(StateReasonKind::HoldTimerExpired);
                    return self.notify(hold_timer_expired(), reason).await;
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.write(Message::Keepalive, deadline).await {
                        return (
                            FsmState::Idle,
                            StateReason::new(StateReasonKind::WriteFailed).with_detail(e),
                        );
                    }
                    continue;
                }
                inbound = recv_inbound(&mut self.session) => inbound,
            };
            match inbound {
                None => return read_failed("receive task stopped"),
                Some(Inbound::Closed(e)) => return read_failed(e),
                Some(Inbound::Invalid(e)) => return self.invalid(e).await,
                Some(Inbound::Malformed(_)) => {
                    return self
                        .unexpected(FsmErrorSubcode::UnexpectedInOpenConfirm, "UPDATE")
                        .await;
                }
                Some(Inbound::Message(Message::Keepalive)) => {
                    return (
                        FsmState::Established,
                        StateReason::new(StateReasonKind::OpenMsgNegotiated),
                    );
                }
                Some(Inbound::Message(Message::Notification(notification))) => {
                    return notification_received(notification);
                }
                Some(Inbound::Message(other)) => {
                    let name = message_name(&other);
                    return self
                        .unexpected(FsmErrorSubcode::UnexpectedInOpenConfirm, name)
                        .await;
                }
            }
        }
    }

    async fn established(&mut self) -> Transition {
        self.restart_timer.disarm();
        let Some(mut negotiated) = self.shared.negotiated() else {
            return read_failed("no negotiated session");
        };
        let Some((writer, token)) = self.session.as_mut().and_then(|session| {
            session
                .writer
                .take()
                .map(|writer| (writer, session.token.clone()))
        }) else {
            return read_failed("no connection");
        };
        let Some(outgoing_rx) = self.outgoing_rx.take() else {
            log::error!(
                "{}: outgoing queue is gone",
                self.shared.neighbor_address
            );
            return (
                FsmState::Idle,
                StateReason::new(StateReasonKind::WriteFailed).with_detail("no outgoing queue"),
            );
        };
        let (notification_tx, notification_rx) = mpsc::channel(1);
        let mut pump: JoinHandle<(mpsc::Receiver<Outgoing>, PumpExit)> = tokio::spawn(
            Pump {
                writer,
                outgoing_rx,
                notification_rx,
                shared: Arc::clone(&self.shared),
                token: token.clone(),
            }
            .run(),
        );
        let config = self.shared.config();
        let mut hold = timers::hold_timer(negotiated.hold_time);

        let exit = loop {
            let inbound = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    let (_, reason) = self.dying();
                    if reason.kind == StateReasonKind::Deconfigured {
                        let cease = Notification::cease(CeaseSubcode::PeerDeconfigured, "");
                        break Exit::Notify(cease, reason);
                    }
                    break Exit::Now(reason);
                }
                Some(control) = self.control_rx.recv() => {
                    if let Some((notification, reason)) = self.apply_control(control) {
                        break Exit::Notify(notification, reason);
                    }
                    continue;
                }
                Some(stream) = self.conn_rx.recv() => {
                    self.reject(stream);
                    continue;
                }
                () = hold.expired() => {
                    let reason = StateReason::new(StateReasonKind::HoldTimerExpired);
                    break Exit::Notify(hold_timer_expired(), reason);
                }
                result = &mut pump => break Exit::Pump(result),
                inbound = recv_inbound(&mut self.session) => inbound,
            };
            hold = timers::hold_timer(negotiated.hold_time);
            match inbound {
                None => break Exit::Now(read_failed("receive task stopped").1),
                Some(Inbound::Closed(e)) => break Exit::Now(read_failed(e).1),
                Some(Inbound::Invalid(e)) => {
                    log::warn!("{}: {e}", self.shared.neighbor_address);
                    let reason = StateReason::new(StateReasonKind::InvalidMsg).with_detail(&e);
                    match e.notification() {
                        Some(notification) => break Exit::Notify(notification, reason),
                        None => break Exit::Now(reason),
                    }
                }
                Some(Inbound::Malformed(malformed)) => {
                    negotiated = self.handle_malformed(*malformed, negotiated, &config).await;
                }
                Some(Inbound::Message(message)) => match message {
                    Message::Keepalive => {}
                    Message::Update(update) => {
                        self.handle_update(update, &negotiated, &config, false).await;
                    }
                    Message::RouteRefresh(refresh) => {
                        self.handle_route_refresh(refresh, &negotiated).await;
                    }
                    Message::Notification(notification) => {
                        break Exit::Now(notification_received(notification).1);
                    }
                    Message::Open(_) => {
                        let reason = StateReason::new(StateReasonKind::InvalidMsg)
                            .with_detail("unexpected OPEN in established");
                        break Exit::Notify(
                            fsm_error(FsmErrorSubcode::UnexpectedInEstablished),
                            reason,
                        );
                    }
                },
            }
        };

        let (joined, reason) = match exit {
            Exit::Pump(joined) => {
                let reason = match &joined {
                    Ok((_, PumpExit::NotificationSent(notification))) => {
                        StateReason::new(StateReasonKind::NotificationSent)
                            .with_notification(notification.clone())
                    }
                    Ok((_, PumpExit::WriteFailed(e))) => {
                        StateReason::new(StateReasonKind::WriteFailed).with_detail(e)
                    }
                    Ok((_, PumpExit::Stopped)) => {
                        StateReason::new(StateReasonKind::WriteFailed).with_detail("pump stopped")
                    }
                    Err(e) => StateReason::new(StateReasonKind::WriteFailed).with_detail(e),
                };
                (joined, reason)
            }
            Exit::Notify(notification, reason) => {
                log::warn!("{}: sending {notification}", self.shared.neighbor_address);
                // The pump may already be gone, in which case there is nobody to tell
                let _ = notification_tx.send(notification.clone()).await;
                let joined = match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut pump).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        token.cancel();
                        pump.await
                    }
                };
                (joined, reason.with_notification(notification))
            }
            Exit::Now(reason) => {
                token.cancel();
                (pump.await, reason)
            }
        };
        match joined {
            Ok((mut outgoing_rx, _)) => {
                let mut dropped = 0usize;
                while outgoing_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    log::debug!(
                        "{}: dropped {dropped} queued outgoing requests",
                        self.shared.neighbor_address
                    );
                }
                self.outgoing_rx = Some(outgoing_rx);
            }
            Err(e) => log::error!("{}: pump task failed: {e}", self.shared.neighbor_address),
        }
        (FsmState::Idle, reason)
    }

    /// Pass the paths of an UPDATE on to the server
    async fn handle_update(
        &mut self,
        mut update: Update,
        negotiated: &Negotiated,
        config: &Neighbor,
        treat_as_withdraw: bool,
    ) {
        let addr = self.shared.neighbor_address;
        if let Some(family) = update.end_of_rib_family() {
            log::info!("{addr}: received End-of-RIB for {family}");
            self.emit(FsmMsg::Update {
                paths: Vec::new(),
                eor: Some(family),
                timestamp: SystemTime::now(),
            })
            .await;
            return;
        }
        if negotiated.two_byte_as {
            update.path_attributes.merge_as4();
        }
        let mut paths = table::paths_from_update(
            update,
            Some(Arc::clone(&negotiated.peer_info)),
            &negotiated.disabled,
            treat_as_withdraw,
        );
        paths.retain(|path| {
            let known = negotiated.families().contains(&path.family);
            if !known {
                log::debug!("{addr}: ignoring path of non-negotiated family {}", path.family);
            }
            known
        });
        if paths.is_empty() {
            self.shared.counters.received.discard();
            return;
        }
        table::reject_own_as_loops(
            &mut paths,
            negotiated.peer_info.local_as,
            config.as_path_options.allow_own_as,
        );
        self.emit(FsmMsg::Update {
            paths,
            eor: None,
            timestamp: SystemTime::now(),
        })
        .await;
    }

    /// Apply RFC 7606 treatments to an UPDATE the session survives
    async fn handle_malformed(
        &mut self,
        malformed: MalformedUpdate,
        mut negotiated: Arc<Negotiated>,
        config: &Neighbor,
    ) -> Arc<Negotiated> {
        let disabled = malformed.disabled_families();
        if !disabled.is_empty() {
            log::warn!(
                "{}: disabling {disabled:?} for the rest of the session",
                self.shared.neighbor_address
            );
            negotiated = Arc::new(negotiated.disable(&disabled));
            self.shared
                .negotiated
                .send_replace(Some(Arc::clone(&negotiated)));
        }
        let withdraw = malformed
            .errors
            .iter()
            .any(|error| error.treatment == Treatment::TreatAsWithdraw);
        self.handle_update(malformed.update, &negotiated, config, withdraw)
            .await;
        negotiated
    }

    async fn handle_route_refresh(&mut self, refresh: RouteRefresh, negotiated: &Negotiated) {
        match refresh.family() {
            Some(family) if negotiated.families().contains(&family) => {
                log::debug!("{}: peer asked to refresh {family}", self.shared.neighbor_address);
                self.emit(FsmMsg::RouteRefresh(family)).await;
            }
            _ => {
                log::debug!(
                    "{}: ignoring ROUTE-REFRESH for AFI {} SAFI {}",
                    self.shared.neighbor_address,
                    refresh.afi,
                    refresh.safi
                );
                self.shared.counters.received.discard();
            }
        }
    }
}

/// Check if leaving Established for `reason` keeps the peer's routes
/// (RFC 4724 Section 4.2, RFC 8538 Section 3)
pub(super) fn graceful_restart_applies(
    gr: &NegotiatedGracefulRestart,
    reason: &StateReason,
) -> bool {
    match reason.kind {
        StateReasonKind::ReadFailed | StateReasonKind::WriteFailed => true,
        StateReasonKind::HoldTimerExpired | StateReasonKind::NotificationSent => reason
            .notification
            .as_ref()
            .is_some_and(|n| n.error_code == NotificationErrorCode::HoldTimerExpired),
        StateReasonKind::NotificationReceived => {
            gr.notification
                && reason
                    .notification
                    .as_ref()
                    .is_some_and(|n| !n.is_hard_reset())
        }
        _ => false,
    }
}

async fn recv_inbound(session: &mut Option<Session>) -> Option<Inbound> {
    match session {
        Some(session) => session.inbound_rx.recv().await,
        None => std::future::pending().await,
    }
}

fn read_failed(detail: impl std::fmt::Display) -> Transition {
    (
        FsmState::Idle,
        StateReason::new(StateReasonKind::ReadFailed).with_detail(detail),
    )
}

fn notification_received(notification: Notification) -> Transition {
    (
        FsmState::Idle,
        StateReason::new(StateReasonKind::NotificationReceived).with_notification(notification),
    )
}

fn hold_timer_expired() -> Notification {
    Notification::new(NotificationErrorCode::HoldTimerExpired, 0, Bytes::new())
}

fn fsm_error(subcode: FsmErrorSubcode) -> Notification {
    Notification::new(
        NotificationErrorCode::FiniteStateMachineError,
        subcode as u8,
        Bytes::new(),
    )
}

const fn message_name(message: &Message) -> &'static str {
    match message {
        Message::Open(_) => "OPEN",
        Message::Update(_) => "UPDATE",
        Message::Notification(_) => "NOTIFICATION",
        Message::Keepalive => "KEEPALIVE",
        Message::RouteRefresh(_) => "ROUTE-REFRESH",
    }
}
