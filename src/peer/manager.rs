//! Swarm manager module
//!
//! Owns the set of known peer addresses and decides which to dial. Peer
//! connections run as separate tasks and report back over an event channel;
//! only the manager task mutates the peer sets.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::TorrentError;
use crate::peer::connection::{ConnectionContext, PeerCommand, PeerConnection, SwarmEvent};
use crate::peer::{Peer, PeerInfo};
use crate::protocol::{Handshake, Message};
use crate::storage::PieceStore;
use crate::torrent::TorrentInfo;
use crate::tracker::{AnnounceRequest, Tracker, TrackerEvent, TrackerResponse};

/// Bounds applied to a tracker-provided announce interval
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
const MAX_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);
/// How long shutdown waits for the `stopped` announces
const STOP_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

type AnnounceOutcome = (Arc<Tracker>, TrackerEvent, Result<TrackerResponse>);

/// Coordinates trackers and peer connections for one torrent
pub struct SwarmManager {
    torrent: Arc<TorrentInfo>,
    ctx: ConnectionContext,
    events: mpsc::UnboundedReceiver<SwarmEvent>,
    trackers: Vec<Arc<Tracker>>,
    /// Known addresses not currently being dialed or connected
    unconnected: HashSet<SocketAddr>,
    connecting: HashSet<SocketAddr>,
    connected: HashSet<SocketAddr>,
    /// Peer ids learned from trackers or handshakes
    peer_ids: HashMap<SocketAddr, [u8; 20]>,
    commands: HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>,
    /// Connected peers currently choking us
    choking_us: HashSet<SocketAddr>,
    tasks: JoinSet<()>,
    /// In-flight tracker announces
    announces: JoinSet<AnnounceOutcome>,
    listener: Option<TcpListener>,
    /// Interval reported by the last successful announce
    announce_interval: Option<Duration>,
    started: bool,
    completed_announced: bool,
    downloaded: u64,
}

impl SwarmManager {
    pub fn new(
        torrent: Arc<TorrentInfo>,
        store: Arc<PieceStore>,
        config: Arc<ClientConfig>,
        trackers: Vec<Tracker>,
    ) -> Self {
        Self::with_peer_id(torrent, store, config, trackers, Handshake::generate_peer_id())
    }

    pub fn with_peer_id(
        torrent: Arc<TorrentInfo>,
        store: Arc<PieceStore>,
        config: Arc<ClientConfig>,
        trackers: Vec<Tracker>,
        our_peer_id: [u8; 20],
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let completed_announced = store.is_complete();
        let ctx = ConnectionContext {
            info_hash: torrent.info_hash,
            our_peer_id,
            store,
            config,
            events: events_tx,
        };
        info!(
            "Swarm for {} ({}) with peer id {}",
            torrent.name,
            torrent.info_hash_hex(),
            hex::encode(our_peer_id)
        );

        Self {
            torrent,
            ctx,
            events,
            trackers: trackers.into_iter().map(Arc::new).collect(),
            unconnected: HashSet::new(),
            connecting: HashSet::new(),
            connected: HashSet::new(),
            peer_ids: HashMap::new(),
            commands: HashMap::new(),
            choking_us: HashSet::new(),
            tasks: JoinSet::new(),
            announces: JoinSet::new(),
            listener: None,
            announce_interval: None,
            started: false,
            completed_announced,
            downloaded: 0,
        }
    }

    pub fn our_peer_id(&self) -> [u8; 20] {
        self.ctx.our_peer_id
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.ctx.store
    }

    pub fn unconnected_count(&self) -> usize {
        self.unconnected.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn connected_addresses(&self) -> Vec<SocketAddr> {
        self.connected.iter().copied().collect()
    }

    /// Add discovered peers; addresses already in any set are skipped
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = PeerInfo>) -> usize {
        let mut added = 0;
        for peer in peers {
            if let Some(id) = peer.peer_id {
                self.peer_ids.insert(peer.addr, id);
            }
            if self.is_known(&peer.addr) {
                trace!("Peer {} already known, skipping", peer.addr);
                continue;
            }
            self.unconnected.insert(peer.addr);
            added += 1;
        }
        if added > 0 {
            debug!("Added {} peers (unconnected: {})", added, self.unconnected.len());
        }
        added
    }

    fn is_known(&self, addr: &SocketAddr) -> bool {
        self.unconnected.contains(addr) || self.connecting.contains(addr) || self.connected.contains(addr)
    }

    fn open_slots(&self) -> usize {
        self.ctx
            .config
            .max_peers
            .saturating_sub(self.connecting.len() + self.connected.len())
    }

    /// Bind the inbound listener on the configured port
    pub async fn listen(&mut self) -> Result<SocketAddr> {
        let addr = self.ctx.config.listen_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!("Failed to bind listener on {}: {}", addr, e);
            TorrentError::network_error_full("Failed to bind listener", addr.clone(), e.to_string())
        })?;
        let local = listener.local_addr()?;
        info!("Listening for peers on {}", local);
        self.listener = Some(listener);
        Ok(local)
    }

    /// Top up connections, announcing when no candidates remain
    ///
    /// Announce results arrive later through [`Self::handle_announce`].
    pub fn rebalance(&mut self) {
        if self.unconnected.is_empty() && !self.trackers.is_empty() && self.announces.is_empty() {
            let event = if self.started { TrackerEvent::None } else { TrackerEvent::Started };
            self.started = true;
            self.spawn_announce(event);
        }
        self.dial_available();
    }

    /// Dial as many unconnected peers as there are free slots
    fn dial_available(&mut self) {
        let count = self.unconnected.len().min(self.open_slots());
        if count == 0 {
            trace!(
                "Nothing to dial (unconnected: {}, connecting: {}, connected: {})",
                self.unconnected.len(),
                self.connecting.len(),
                self.connected.len()
            );
            return;
        }

        let targets: Vec<SocketAddr> = self.unconnected.iter().take(count).copied().collect();
        info!("Dialing {} peers", targets.len());
        for addr in targets {
            self.dial(addr);
        }
    }

    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            peer_id: self.ctx.our_peer_id,
            port: self.ctx.config.listen_port,
            uploaded: 0,
            downloaded: self.downloaded,
            left: self.ctx.store.left(),
            event,
            num_wanted: self.ctx.config.num_wanted,
            compact: true,
        }
    }

    /// Announce to every tracker in parallel
    pub fn spawn_announce(&mut self, event: TrackerEvent) {
        let request = self.announce_request(event);
        info!("Announcing {:?} to {} trackers", event, self.trackers.len());
        for tracker in &self.trackers {
            let tracker = Arc::clone(tracker);
            let request = request.clone();
            self.announces.spawn(async move {
                let result = tracker.announce(&request).await;
                (tracker, event, result)
            });
        }
    }

    /// Record one announce outcome; a failing tracker is logged and skipped
    pub fn handle_announce(&mut self, outcome: AnnounceOutcome) {
        let (tracker, event, result) = outcome;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Announce {:?} to {} failed: {}", event, tracker.url(), e);
                return;
            }
        };

        if let Some(warning) = &response.warning {
            warn!("Tracker {} warning: {}", tracker.url(), warning);
        }
        self.announce_interval = Some(Duration::from_secs(response.interval as u64));
        let added = self.add_peers(response.peers);
        info!("Tracker {} gave {} new peers", tracker.url(), added);
        self.dial_available();
    }

    /// Seconds between periodic rebalance attempts
    fn tick_period(&self) -> Duration {
        match self.announce_interval {
            Some(interval) => interval.clamp(MIN_ANNOUNCE_INTERVAL, MAX_ANNOUNCE_INTERVAL),
            None => self.ctx.config.rebalance(),
        }
    }

    fn dial(&mut self, addr: SocketAddr) {
        self.unconnected.remove(&addr);
        self.connecting.insert(addr);

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands.insert(addr, tx);

        let peer = match self.peer_ids.get(&addr) {
            Some(id) => Peer::with_peer_id(addr, *id),
            None => Peer::new(addr),
        };
        let ctx = self.ctx.clone();
        self.tasks.spawn(async move {
            let events = ctx.events.clone();
            match PeerConnection::connect(peer, ctx, rx).await {
                Ok(connection) => {
                    let _ = connection.run().await;
                }
                Err(e) => {
                    let _ = events.send(SwarmEvent::ConnectFailed { addr, reason: e.to_string() });
                }
            }
        });
    }

    /// Take an inbound stream straight into the connected set
    pub fn accept(&mut self, socket: TcpStream) {
        if self.open_slots() == 0 {
            debug!("Dropping inbound connection: {} peers already", self.ctx.config.max_peers);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connection = match PeerConnection::from_socket(socket, self.ctx.clone(), rx) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Rejecting inbound connection: {}", e);
                return;
            }
        };
        let addr = connection.peer_addr();
        if self.connecting.contains(&addr) || self.connected.contains(&addr) {
            debug!("Dropping duplicate inbound connection from {}", addr);
            return;
        }

        self.unconnected.remove(&addr);
        self.connected.insert(addr);
        self.choking_us.insert(addr);
        self.commands.insert(addr, tx);
        self.tasks.spawn(async move {
            let _ = connection.run().await;
        });
    }

    /// Send `message` to every connected peer not choking us, except `exclude`
    pub fn broadcast(&self, message: &Message, exclude: Option<SocketAddr>) -> usize {
        let mut sent = 0;
        for addr in &self.connected {
            if Some(*addr) == exclude || self.choking_us.contains(addr) {
                continue;
            }
            if let Some(tx) = self.commands.get(addr) {
                if tx.send(PeerCommand::Send(message.clone())).is_ok() {
                    sent += 1;
                }
            }
        }
        trace!("Broadcast {:?} to {} peers", message.message_id(), sent);
        sent
    }

    fn forget(&mut self, addr: &SocketAddr) {
        self.unconnected.remove(addr);
        self.connecting.remove(addr);
        self.connected.remove(addr);
        self.choking_us.remove(addr);
        self.commands.remove(addr);
    }

    pub fn handle_event(&mut self, event: SwarmEvent) -> Result<()> {
        match event {
            SwarmEvent::Connected { addr, peer_id } => {
                self.connecting.remove(&addr);
                self.connected.insert(addr);
                self.choking_us.insert(addr);
                self.peer_ids.insert(addr, peer_id);
                info!(
                    "Peer {} connected ({} connected, {} connecting)",
                    addr,
                    self.connected.len(),
                    self.connecting.len()
                );
            }
            SwarmEvent::Disconnected { addr, reason } => {
                info!("Peer {} disconnected: {}", addr, reason);
                self.forget(&addr);
                self.rebalance();
            }
            SwarmEvent::ConnectFailed { addr, reason } => {
                debug!("Failed to connect to {}: {}", addr, reason);
                self.forget(&addr);
                self.rebalance();
            }
            SwarmEvent::BlockCompleted { index, from } => {
                self.downloaded += self.ctx.store.block_len(index).unwrap_or(0);
                let have = Message::have(index as u64)?;
                self.broadcast(&have, Some(from));

                let missing = self.ctx.store.missing_count();
                debug!("Block {} done, {} missing", index, missing);
                if missing == 0 && !self.completed_announced {
                    info!("Download of {} complete", self.torrent.name);
                    self.completed_announced = true;
                    self.spawn_announce(TrackerEvent::Completed);
                }
            }
            SwarmEvent::ChokeChanged { addr, choked } => {
                if choked {
                    self.choking_us.insert(addr);
                } else {
                    self.choking_us.remove(&addr);
                }
            }
        }
        Ok(())
    }

    /// Drive the swarm until `shutdown` resolves, then shut down
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.ctx.config.accept_inbound && self.listener.is_none() {
            if let Err(e) = self.listen().await {
                warn!("Inbound connections disabled: {}", e);
            }
        }

        self.rebalance();
        let mut next_tick = Instant::now() + self.tick_period();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events.recv() => {
                    self.handle_event(event)?;
                }
                Some(joined) = self.announces.join_next(), if !self.announces.is_empty() => match joined {
                    Ok(outcome) => self.handle_announce(outcome),
                    Err(e) => error!("Announce task failed: {}", e),
                },
                accepted = accept_next(self.listener.as_ref()) => match accepted {
                    Ok((socket, addr)) => {
                        debug!("Inbound connection from {}", addr);
                        self.accept(socket);
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Peer task failed: {}", e);
                    }
                }
                _ = sleep_until(next_tick) => {
                    trace!("Rebalance tick");
                    self.rebalance();
                    next_tick = Instant::now() + self.tick_period();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close every connection and tell the trackers we are leaving
    pub async fn shutdown(&mut self) {
        info!("Shutting down swarm ({} connected)", self.connected.len());
        for tx in self.commands.values() {
            let _ = tx.send(PeerCommand::Close);
        }
        self.announces.abort_all();
        while self.announces.join_next().await.is_some() {}

        if self.started {
            self.spawn_announce(TrackerEvent::Stopped);
            let drained = timeout(STOP_ANNOUNCE_TIMEOUT, async {
                while let Some(joined) = self.announces.join_next().await {
                    if let Ok((tracker, _, Err(e))) = joined {
                        debug!("Stopped announce to {} failed: {}", tracker.url(), e);
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!("Trackers did not acknowledge shutdown in time");
                self.announces.abort_all();
            }
        }
        self.tasks.shutdown().await;

        self.commands.clear();
        self.connecting.clear();
        self.connected.clear();
        self.choking_us.clear();
        self.listener = None;
    }
}

async fn accept_next(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
