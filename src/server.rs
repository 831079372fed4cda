//! Peer supervisor
//!
//! Owns the session of every configured neighbor, hands accepted
//! connections to them, and turns their events into [`WatchEvent`]s.
//! Graceful restart and prefix limits are tracked here because they outlive
//! a single session.

// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::bgp::{route, Family, Open};
use crate::config::{self, Config, Global, Neighbor};
use crate::fsm::{
    self, AdminState, AdminStateOperation, FsmEvent, FsmHandle, FsmMsg, FsmState, Negotiated,
    Outgoing, SessionStatus, StateReason, StateReasonKind, MESSAGE_QUEUE_LEN,
};
use crate::table::Path;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Events kept for slow watchers before they start missing some
const WATCH_QUEUE_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Fsm(#[from] fsm::Error),
    #[error("cannot listen on {0}: {1}")]
    Listen(SocketAddr, io::Error),
    #[error("neighbor {0} is not configured")]
    UnknownNeighbor(IpAddr),
}

/// A session changed state
#[derive(Clone, Debug)]
pub struct PeerState {
    pub neighbor_address: IpAddr,
    pub peer_as: u32,
    pub local_as: u32,
    /// Known once an OPEN was received
    pub peer_id: Option<Ipv4Addr>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub sent_open: Option<Open>,
    pub received_open: Option<Open>,
    pub old_state: FsmState,
    pub state: FsmState,
    pub admin_state: AdminState,
    pub reason: StateReason,
    pub timestamp: SystemTime,
}

impl PeerState {
    fn new(
        neighbor_address: IpAddr,
        config: Option<&Neighbor>,
        (old_state, state): (FsmState, FsmState),
        reason: StateReason,
        admin_state: AdminState,
        negotiated: Option<&Negotiated>,
    ) -> Self {
        let (peer_as, local_as) = negotiated
            .map(|negotiated| (negotiated.peer_info.peer_as, negotiated.peer_info.local_as))
            .or_else(|| config.map(|config| (config.peer_as, config.local_as)))
            .unwrap_or_default();
        Self {
            neighbor_address,
            peer_as,
            local_as,
            peer_id: negotiated.map(|negotiated| negotiated.peer_info.peer_id),
            local_addr: negotiated.map(|negotiated| negotiated.local_addr),
            peer_addr: negotiated.map(|negotiated| negotiated.peer_addr),
            sent_open: negotiated.map(|negotiated| negotiated.sent_open.clone()),
            received_open: negotiated.map(|negotiated| negotiated.received_open.clone()),
            old_state,
            state,
            admin_state,
            reason,
            timestamp: SystemTime::now(),
        }
    }
}

/// What watchers of the server see
#[derive(Clone, Debug)]
pub enum WatchEvent {
    PeerState(Box<PeerState>),
    /// Paths from one UPDATE, or an End-of-RIB marker
    Update {
        neighbor: IpAddr,
        paths: Vec<Path>,
        eor: Option<Family>,
        timestamp: SystemTime,
    },
    /// The peer wants our routes of `family` again
    RouteRefresh { neighbor: IpAddr, family: Family },
    /// Keep the paths of these families while the peer restarts
    Stale {
        neighbor: IpAddr,
        families: Vec<Family>,
    },
    /// Keep the paths of these families as long-lived stale (RFC 9494)
    LlgrStale {
        neighbor: IpAddr,
        families: Vec<Family>,
    },
    /// Remove every path of these families
    Drop {
        neighbor: IpAddr,
        families: Vec<Family>,
    },
    /// Remove the paths of these families not refreshed since the restart
    DropStale {
        neighbor: IpAddr,
        families: Vec<Family>,
    },
}

type Neighbors = Arc<Mutex<HashMap<IpAddr, FsmHandle>>>;

fn lock(
    neighbors: &Mutex<HashMap<IpAddr, FsmHandle>>,
) -> MutexGuard<'_, HashMap<IpAddr, FsmHandle>> {
    neighbors.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A BGP speaker with its neighbors
///
/// Cloning gives another handle to the same server.
#[derive(Clone, Debug)]
pub struct Server {
    global: Arc<Global>,
    neighbors: Neighbors,
    events_tx: mpsc::Sender<FsmEvent>,
    watch_tx: broadcast::Sender<WatchEvent>,
    cancel: CancellationToken,
}

impl Server {
    /// Start a server without neighbors
    ///
    /// Everything stops when `cancel` is cancelled.
    pub fn new(global: Global, cancel: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::channel(MESSAGE_QUEUE_LEN);
        let (watch_tx, _) = broadcast::channel(WATCH_QUEUE_LEN);
        let neighbors = Neighbors::default();
        let supervisor = Supervisor::new(
            Arc::clone(&neighbors),
            watch_tx.clone(),
            cancel.child_token(),
        );
        tokio::spawn(supervisor.run(events_rx));
        Self {
            global: Arc::new(global),
            neighbors,
            events_tx,
            watch_tx,
            cancel,
        }
    }

    /// Start a server with every neighbor of a validated configuration
    pub fn from_config(config: Config, cancel: CancellationToken) -> Result<Self, Error> {
        let server = Self::new(config.global, cancel);
        for neighbor in config.neighbors {
            server.add_neighbor(neighbor)?;
        }
        Ok(server)
    }

    #[must_use]
    pub fn global(&self) -> &Global {
        &self.global
    }

    /// Receive events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }

    fn neighbors(&self) -> MutexGuard<'_, HashMap<IpAddr, FsmHandle>> {
        lock(&self.neighbors)
    }

    fn with_neighbor<T>(
        &self,
        addr: IpAddr,
        f: impl FnOnce(&FsmHandle) -> Result<T, fsm::Error>,
    ) -> Result<T, Error> {
        let neighbors = self.neighbors();
        let handle = neighbors.get(&addr).ok_or(Error::UnknownNeighbor(addr))?;
        Ok(f(handle)?)
    }

    /// Configure a neighbor and start its session
    pub fn add_neighbor(&self, mut neighbor: Neighbor) -> Result<(), Error> {
        neighbor.validate(&self.global)?;
        let addr = neighbor.neighbor_address;
        let mut neighbors = self.neighbors();
        if neighbors.contains_key(&addr) {
            return Err(config::Error::DuplicateNeighbor(addr).into());
        }
        log::info!("{addr}: adding neighbor in AS {}", neighbor.peer_as);
        let handle = FsmHandle::spawn(
            Arc::clone(&self.global),
            neighbor,
            self.events_tx.clone(),
            self.cancel.child_token(),
        );
        neighbors.insert(addr, handle);
        Ok(())
    }

    /// Remove a neighbor, closing an established session with
    /// CEASE/Peer De-configured
    pub async fn delete_neighbor(&self, addr: IpAddr) -> Result<(), Error> {
        let handle = self
            .neighbors()
            .remove(&addr)
            .ok_or(Error::UnknownNeighbor(addr))?;
        log::info!("{addr}: deleting neighbor");
        handle.deconfigure();
        handle.join().await;
        Ok(())
    }

    /// Replace the configuration of a neighbor
    ///
    /// The new settings are used from the next connection on; reset the
    /// peer to apply them at once.
    pub fn update_neighbor(&self, mut neighbor: Neighbor) -> Result<(), Error> {
        neighbor.validate(&self.global)?;
        let addr = neighbor.neighbor_address;
        self.with_neighbor(addr, |handle| {
            handle.update_config(neighbor);
            Ok(())
        })
    }

    /// Addresses of the configured neighbors
    #[must_use]
    pub fn neighbor_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<_> = self.neighbors().keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub fn status(&self, addr: IpAddr) -> Result<SessionStatus, Error> {
        self.with_neighbor(addr, |handle| Ok(handle.status()))
    }

    /// Set the admin state to Up, also after a prefix limit shutdown
    pub fn enable_peer(&self, addr: IpAddr) -> Result<(), Error> {
        self.with_neighbor(addr, |handle| {
            handle.set_admin_state(AdminStateOperation::new(AdminState::Up, ""))
        })
    }

    /// Set the admin state to Down, closing the session with
    /// CEASE/Administrative Shutdown and `communication`
    pub fn disable_peer(&self, addr: IpAddr, communication: &str) -> Result<(), Error> {
        self.with_neighbor(addr, |handle| {
            handle.set_admin_state(AdminStateOperation::new(AdminState::Down, communication))
        })
    }

    /// Close the session with CEASE/Administrative Reset
    pub fn reset_peer(&self, addr: IpAddr, communication: &str) -> Result<(), Error> {
        self.with_neighbor(addr, |handle| handle.reset(communication))
    }

    /// Queue something for the peer, waiting while its queue is full
    pub async fn send(&self, addr: IpAddr, outgoing: Outgoing) -> Result<(), Error> {
        let tx = self.with_neighbor(addr, |handle| Ok(handle.outgoing()))?;
        tx.send(outgoing)
            .await
            .map_err(|_| fsm::Error::Stopped(addr))?;
        Ok(())
    }

    /// Advertise or withdraw paths
    pub async fn send_paths(&self, addr: IpAddr, paths: Vec<Path>) -> Result<(), Error> {
        self.send(addr, Outgoing::Paths(paths)).await
    }

    /// Hand an accepted connection to the session of its neighbor
    ///
    /// The connection is closed if no neighbor has its address or the
    /// session cannot take it now.
    pub fn pass_conn(&self, stream: TcpStream) {
        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(e) => {
                log::debug!("Dropping accepted connection: {e}");
                return;
            }
        };
        let addr = remote.ip().to_canonical();
        let neighbors = self.neighbors();
        let Some(handle) = neighbors.get(&addr) else {
            log::warn!("Closing connection from {remote}: not a neighbor");
            return;
        };
        if handle.pass_conn(stream).is_err() {
            log::warn!("{addr}: closing connection from {remote}: session is busy");
        }
    }

    /// Accept connections on every listen address until cancelled
    ///
    /// Without listen addresses this only waits for the cancellation, so
    /// sessions can still be dialed.
    pub async fn serve(&self) -> Result<(), Error> {
        let mut listeners = Vec::with_capacity(self.global.listen_addresses.len());
        for &ip in &self.global.listen_addresses {
            let addr = SocketAddr::new(ip, self.global.port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Listen(addr, e))?;
            log::info!("Listening on {addr}");
            listeners.push(listener);
        }
        futures_util::future::join_all(
            listeners
                .into_iter()
                .map(|listener| self.accept_loop(listener)),
        )
        .await;
        self.cancel.cancelled().await;
        Ok(())
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                result = listener.accept() => match result {
                    Ok((stream, remote)) => {
                        log::debug!("Accepted connection from {remote}");
                        self.pass_conn(stream);
                    }
                    Err(e) => log::warn!("Failed to accept connection: {e}"),
                },
            }
        }
    }

    /// Stop every session and wait for them to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.neighbors().drain().map(|(_, handle)| handle).collect();
        for handle in handles {
            handle.join().await;
        }
    }
}

/// Graceful restart of a peer in progress
#[derive(Debug)]
struct Restart {
    negotiated: Arc<Negotiated>,
    /// Families kept stale until End-of-RIB
    stale: BTreeSet<Family>,
    eor: BTreeSet<Family>,
    /// Families kept after the restart timer until their stale time is over
    long_lived: BTreeSet<Family>,
    timers: CancellationToken,
}

impl Restart {
    fn families(&self) -> Vec<Family> {
        self.stale.union(&self.long_lived).copied().collect()
    }
}

/// What the supervisor remembers about a neighbor between sessions
#[derive(Debug, Default)]
struct PeerBook {
    config: Option<Neighbor>,
    restart: Option<Restart>,
    /// Received prefixes by family, `true` if stale
    adj_in: HashMap<Family, HashMap<route::Value, bool>>,
    /// Families above their warning threshold
    warned: BTreeSet<Family>,
    /// PfxCt already requested for this session
    limit_hit: bool,
}

impl PeerBook {
    fn prefix_count(&self, family: Family) -> usize {
        self.adj_in.get(&family).map_or(0, HashMap::len)
    }

    fn mark_stale(&mut self, families: &BTreeSet<Family>) {
        for family in families {
            if let Some(table) = self.adj_in.get_mut(family) {
                table.values_mut().for_each(|stale| *stale = true);
            }
        }
    }

    fn drop_stale(&mut self, families: &[Family]) {
        for family in families {
            if let Some(table) = self.adj_in.get_mut(family) {
                table.retain(|_, stale| !*stale);
            }
        }
    }

    fn drop_families(&mut self, families: &[Family]) {
        for family in families {
            self.adj_in.remove(family);
        }
    }

    fn end_restart(&mut self) {
        if let Some(restart) = self.restart.take() {
            restart.timers.cancel();
        }
    }
}

/// Consumes session events and publishes watch events
struct Supervisor {
    neighbors: Neighbors,
    watch_tx: broadcast::Sender<WatchEvent>,
    peers: HashMap<IpAddr, PeerBook>,
    llgr_tx: mpsc::Sender<(IpAddr, Family)>,
    llgr_rx: mpsc::Receiver<(IpAddr, Family)>,
    cancel: CancellationToken,
}

impl Supervisor {
    fn new(
        neighbors: Neighbors,
        watch_tx: broadcast::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (llgr_tx, llgr_rx) = mpsc::channel(MESSAGE_QUEUE_LEN);
        Self {
            neighbors,
            watch_tx,
            peers: HashMap::new(),
            llgr_tx,
            llgr_rx,
            cancel,
        }
    }

    async fn run(mut self, mut events_rx: mpsc::Receiver<FsmEvent>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(event) = events_rx.recv() => self.handle_event(event),
                Some((addr, family)) = self.llgr_rx.recv() => self.llgr_expired(addr, family),
            }
        }
        log::debug!("Supervisor stopped");
    }

    fn publish(&self, event: WatchEvent) {
        // Nobody watching is fine
        let _ = self.watch_tx.send(event);
    }

    /// Configuration of `addr`, remembered for after it is deleted
    fn refresh_config(&mut self, addr: IpAddr) -> Option<Neighbor> {
        let config = lock(&self.neighbors).get(&addr).map(FsmHandle::config);
        let book = self.peers.entry(addr).or_default();
        if config.is_some() {
            book.config = config;
        }
        book.config.clone()
    }

    fn handle_event(&mut self, event: FsmEvent) {
        let addr = event.neighbor;
        match event.msg {
            FsmMsg::StateChange {
                old,
                new,
                reason,
                admin_state,
                negotiated,
            } => self.state_changed(addr, (old, new), reason, admin_state, negotiated),
            FsmMsg::Update {
                paths,
                eor,
                timestamp,
            } => {
                if eor.is_none() {
                    self.count_prefixes(addr, &paths);
                }
                self.publish(WatchEvent::Update {
                    neighbor: addr,
                    paths,
                    eor,
                    timestamp,
                });
                if let Some(family) = eor {
                    self.end_of_rib(addr, family);
                }
            }
            FsmMsg::RouteRefresh(family) => self.publish(WatchEvent::RouteRefresh {
                neighbor: addr,
                family,
            }),
        }
    }

    fn state_changed(
        &mut self,
        addr: IpAddr,
        (old, new): (FsmState, FsmState),
        reason: StateReason,
        admin_state: AdminState,
        negotiated: Option<Arc<Negotiated>>,
    ) {
        let config = self.refresh_config(addr);
        let kind = reason.kind;
        self.publish(WatchEvent::PeerState(Box::new(PeerState::new(
            addr,
            config.as_ref(),
            (old, new),
            reason,
            admin_state,
            negotiated.as_deref(),
        ))));
        if old == FsmState::Established && new != FsmState::Established {
            self.session_down(addr, kind, negotiated.clone(), config.as_ref());
        }
        match (new, kind) {
            (FsmState::Established, _) => self.session_up(addr, negotiated.as_deref()),
            (_, StateReasonKind::Deconfigured) => self.forget(addr),
            (FsmState::Idle, StateReasonKind::RestartTimerExpired) => {
                self.restart_timer_expired(addr);
            }
            _ => {}
        }
    }

    fn session_down(
        &mut self,
        addr: IpAddr,
        kind: StateReasonKind,
        negotiated: Option<Arc<Negotiated>>,
        config: Option<&Neighbor>,
    ) {
        let timers = self.cancel.child_token();
        let book = self.peers.entry(addr).or_default();
        let restarting = negotiated
            .filter(|negotiated| negotiated.graceful_restart.is_some())
            .filter(|_| kind == StateReasonKind::GracefulRestart);
        let Some(negotiated) = restarting else {
            let mut families = config.map(Neighbor::families).unwrap_or_default();
            if let Some(restart) = &book.restart {
                for family in restart.families() {
                    if !families.contains(&family) {
                        families.push(family);
                    }
                }
            }
            book.end_restart();
            book.adj_in.clear();
            if !families.is_empty() {
                self.publish(WatchEvent::Drop {
                    neighbor: addr,
                    families,
                });
            }
            return;
        };
        let (stale, dropped): (Vec<Family>, Vec<Family>) =
            negotiated.families().iter().copied().partition(|family| {
                negotiated
                    .graceful_restart
                    .as_ref()
                    .is_some_and(|gr| gr.forwarding(*family))
            });
        let stale: BTreeSet<Family> = stale.into_iter().collect();
        let restart_time = negotiated
            .graceful_restart
            .as_ref()
            .map_or(0, |gr| gr.restart_time);
        log::info!("{addr}: peer restarting, keeping {stale:?} for {restart_time}s");
        book.end_restart();
        book.mark_stale(&stale);
        book.drop_families(&dropped);
        let stale_families: Vec<_> = stale.iter().copied().collect();
        book.restart = Some(Restart {
            negotiated,
            stale,
            eor: BTreeSet::new(),
            long_lived: BTreeSet::new(),
            timers,
        });
        if !stale_families.is_empty() {
            self.publish(WatchEvent::Stale {
                neighbor: addr,
                families: stale_families,
            });
        }
        if !dropped.is_empty() {
            self.publish(WatchEvent::Drop {
                neighbor: addr,
                families: dropped,
            });
        }
    }

    /// A new session replaces a restarting one (RFC 4724 Section 4.2)
    fn session_up(&mut self, addr: IpAddr, negotiated: Option<&Negotiated>) {
        let timers = self.cancel.child_token();
        let book = self.peers.entry(addr).or_default();
        book.warned.clear();
        book.limit_hit = false;
        let (Some(restart), Some(negotiated)) = (book.restart.as_mut(), negotiated) else {
            return;
        };
        // Stale paths now wait for End-of-RIB instead of timers
        restart.timers.cancel();
        restart.timers = timers;
        let mut gone = Vec::new();
        let mut lost = Vec::new();
        let mut waiting = BTreeSet::new();
        for family in restart.families() {
            if !negotiated.families().contains(&family) {
                gone.push(family);
            } else if !negotiated
                .graceful_restart
                .as_ref()
                .is_some_and(|gr| gr.forwarding(family))
            {
                lost.push(family);
            } else {
                waiting.insert(family);
            }
        }
        restart.stale = waiting;
        restart.long_lived.clear();
        restart.eor.clear();
        if restart.stale.is_empty() {
            book.end_restart();
        }
        book.drop_families(&gone);
        book.drop_stale(&lost);
        if !gone.is_empty() {
            log::info!("{addr}: {gone:?} not negotiated after restart");
            self.publish(WatchEvent::Drop {
                neighbor: addr,
                families: gone,
            });
        }
        if !lost.is_empty() {
            log::info!("{addr}: forwarding state of {lost:?} lost in restart");
            self.publish(WatchEvent::DropStale {
                neighbor: addr,
                families: lost,
            });
        }
    }

    fn restart_timer_expired(&mut self, addr: IpAddr) {
        let Some(book) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(restart) = book.restart.as_mut() else {
            return;
        };
        let gr = restart.negotiated.graceful_restart.as_ref();
        let (long_lived, dropped): (Vec<Family>, Vec<Family>) =
            restart.families().into_iter().partition(|family| {
                gr.and_then(|gr| gr.stale_time(*family))
                    .is_some_and(|stale_time| stale_time > 0)
            });
        let long_lived: BTreeSet<Family> = long_lived.into_iter().collect();
        for &family in &long_lived {
            let stale_time = gr.and_then(|gr| gr.stale_time(family)).unwrap_or_default();
            log::info!("{addr}: keeping {family} as long-lived stale for {stale_time}s");
            spawn_llgr_timer(
                addr,
                family,
                Duration::from_secs(u64::from(stale_time)),
                restart.timers.clone(),
                self.llgr_tx.clone(),
            );
        }
        restart.stale.clear();
        restart.long_lived = long_lived.clone();
        if long_lived.is_empty() {
            book.end_restart();
        }
        book.drop_families(&dropped);
        if !long_lived.is_empty() {
            self.publish(WatchEvent::LlgrStale {
                neighbor: addr,
                families: long_lived.into_iter().collect(),
            });
        }
        if !dropped.is_empty() {
            self.publish(WatchEvent::Drop {
                neighbor: addr,
                families: dropped,
            });
        }
    }

    fn llgr_expired(&mut self, addr: IpAddr, family: Family) {
        let Some(book) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(restart) = book.restart.as_mut() else {
            return;
        };
        if !restart.long_lived.remove(&family) {
            return;
        }
        log::info!("{addr}: long-lived stale time of {family} is over");
        if restart.long_lived.is_empty() && restart.stale.is_empty() {
            book.end_restart();
        }
        book.drop_families(&[family]);
        self.publish(WatchEvent::Drop {
            neighbor: addr,
            families: vec![family],
        });
    }

    fn end_of_rib(&mut self, addr: IpAddr, family: Family) {
        let Some(book) = self.peers.get_mut(&addr) else {
            return;
        };
        let Some(restart) = book.restart.as_mut() else {
            return;
        };
        if !restart.stale.contains(&family) {
            return;
        }
        restart.eor.insert(family);
        if !restart.stale.is_subset(&restart.eor) {
            return;
        }
        let families: Vec<_> = restart.stale.iter().copied().collect();
        log::info!("{addr}: restart complete");
        book.end_restart();
        book.drop_stale(&families);
        self.publish(WatchEvent::DropStale {
            neighbor: addr,
            families,
        });
    }

    fn forget(&mut self, addr: IpAddr) {
        let Some(mut book) = self.peers.remove(&addr) else {
            return;
        };
        let families = book.restart.as_ref().map(Restart::families);
        book.end_restart();
        if let Some(families) = families.filter(|families| !families.is_empty()) {
            self.publish(WatchEvent::Drop {
                neighbor: addr,
                families,
            });
        }
    }

    fn count_prefixes(&mut self, addr: IpAddr, paths: &[Path]) {
        let config = self.refresh_config(addr);
        let book = self.peers.entry(addr).or_default();
        let mut families = BTreeSet::new();
        for path in paths {
            let table = book.adj_in.entry(path.family).or_default();
            if path.withdrawal {
                table.remove(&path.nlri);
            } else {
                table.insert(path.nlri.clone(), false);
            }
            families.insert(path.family);
        }
        let Some(config) = config else {
            return;
        };
        for family in families {
            let Some(limit) = config
                .afi_safi(family)
                .map(|afi_safi| &afi_safi.prefix_limit)
                .filter(|limit| limit.max_prefixes != 0)
            else {
                continue;
            };
            let count = book.prefix_count(family) as u64;
            let max = u64::from(limit.max_prefixes);
            let pct = u64::from(limit.shutdown_threshold_pct);
            if pct != 0 && count * 100 > max * pct {
                if book.warned.insert(family) {
                    log::warn!("{addr}: {count} prefixes of {family}, above {pct}% of {max}");
                }
            } else {
                book.warned.remove(&family);
            }
            if count > max && !book.limit_hit {
                book.limit_hit = true;
                log::warn!("{addr}: {count} prefixes of {family}, above the limit of {max}");
                let op = AdminStateOperation::new(AdminState::PfxCt, "");
                match lock(&self.neighbors).get(&addr) {
                    Some(handle) => {
                        if let Err(e) = handle.set_admin_state(op) {
                            log::error!("{addr}: cannot stop session: {e}");
                        }
                    }
                    None => log::debug!("{addr}: neighbor is gone"),
                }
            }
        }
    }
}

fn spawn_llgr_timer(
    addr: IpAddr,
    family: Family,
    stale_time: Duration,
    token: CancellationToken,
    tx: mpsc::Sender<(IpAddr, Family)>,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = tokio::time::sleep(stale_time) => {
                // The supervisor may have stopped
                let _ = tx.send((addr, family)).await;
            }
        }
    });
}
