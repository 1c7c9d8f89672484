//! Peer connection module
//!
//! Drives one peer through handshake and the message loop: choke and
//! interest negotiation, block selection, request tiling, serving requests
//! and keep-alives. Works over any duplex byte stream.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::TorrentError;
use crate::peer::{Peer, PeerState};
use crate::protocol::{BitTorrentWire, Bitfield, Handshake, Message, WireProtocol};
use crate::storage::PieceStore;

/// Inbound frames buffered between the reader task and the message loop
const INBOUND_QUEUE: usize = 256;

/// Instructions from the swarm manager to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Write a message to the peer
    Send(Message),
    /// Close the connection
    Close,
}

/// Notifications from connections (and dial tasks) to the swarm manager
#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEvent {
    /// Handshake completed
    Connected { addr: SocketAddr, peer_id: [u8; 20] },
    /// Connection ended after it was established or accepted
    Disconnected { addr: SocketAddr, reason: String },
    /// Outbound dial failed
    ConnectFailed { addr: SocketAddr, reason: String },
    /// A block was downloaded and verified
    BlockCompleted { index: usize, from: SocketAddr },
    /// The remote choked or unchoked us
    ChokeChanged { addr: SocketAddr, choked: bool },
}

/// Swarm-wide state every connection works against
#[derive(Clone)]
pub struct ConnectionContext {
    pub info_hash: [u8; 20],
    pub our_peer_id: [u8; 20],
    pub store: Arc<PieceStore>,
    pub config: Arc<ClientConfig>,
    pub events: mpsc::UnboundedSender<SwarmEvent>,
}

/// A peer connection prior to running
pub struct PeerConnection<S> {
    /// Peer information
    pub peer: Peer,
    stream: S,
    ctx: ConnectionContext,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    wire: BitTorrentWire,
}

impl PeerConnection<TcpStream> {
    /// Dial a peer, bounded by the configured connect timeout
    pub async fn connect(
        peer: Peer,
        ctx: ConnectionContext,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<Self> {
        let addr = peer.addr;
        info!("Connecting to peer: {}", addr);

        let socket = timeout(ctx.config.connect(), TcpStream::connect(addr))
            .await
            .map_err(|e| {
                warn!("Connection timeout to {}", addr);
                TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        debug!("Connected to peer: {}", addr);
        Ok(Self::new(socket, peer, ctx, commands))
    }

    /// Wrap an accepted inbound socket
    pub fn from_socket(
        socket: TcpStream,
        ctx: ConnectionContext,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<Self> {
        let peer_addr = socket.peer_addr().map_err(|e| {
            error!("Failed to get peer address from socket: {}", e);
            TorrentError::peer_error_full("Failed to get peer address", "unknown".to_string(), e.to_string())
        })?;
        info!("Accepted peer connection from: {}", peer_addr);
        Ok(Self::new(socket, Peer::new(peer_addr), ctx, commands))
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: S,
        peer: Peer,
        ctx: ConnectionContext,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        Self {
            peer,
            stream,
            ctx,
            commands,
            wire: BitTorrentWire,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer.addr
    }

    /// Run the connection to completion
    ///
    /// The swarm manager is always told about the disconnect, whatever the
    /// outcome. A protocol violation by the remote is returned as an error.
    pub async fn run(self) -> Result<()> {
        let addr = self.peer.addr;
        let events = self.ctx.events.clone();

        let result = self.drive().await;
        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(e) => e.to_string(),
        };
        match &result {
            Ok(()) => info!("Connection to {} closed", addr),
            Err(e) => warn!("Connection to {} failed: {}", addr, e),
        }

        let _ = events.send(SwarmEvent::Disconnected { addr, reason });
        result
    }

    async fn drive(self) -> Result<()> {
        let PeerConnection {
            mut peer,
            mut stream,
            ctx,
            commands,
            mut wire,
        } = self;

        peer.set_state(PeerState::Handshaking);
        let handshake = timeout(
            ctx.config.idle(),
            perform_handshake(&mut wire, &mut stream, &mut peer, &ctx),
        )
        .await
        .map_err(|e| TorrentError::peer_error_full("Handshake timeout", peer.addr.to_string(), e.to_string()))?;
        handshake?;

        peer.set_state(PeerState::Active);
        let peer_id = peer.peer_id.unwrap_or_default();
        let _ = ctx.events.send(SwarmEvent::Connected { addr: peer.addr, peer_id });

        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let reader_task = tokio::spawn(read_loop(reader, inbound_tx, peer.addr));

        let remote = Bitfield::new(ctx.store.num_blocks());
        peer.bitfield = remote;
        let mut session = Session {
            peer,
            ctx,
            writer,
            wire,
            pending: HashMap::new(),
            hash_failures: 0,
            last_received: Instant::now(),
            requested_at: Instant::now(),
        };

        let result = session.message_loop(inbound_rx, commands).await;
        reader_task.abort();
        session.peer.set_state(PeerState::Closed);

        let stats = session.peer.stats();
        info!(
            "Peer {}: {} blocks down ({:.0} B/s), {} blocks up ({:.0} B/s), has {} blocks",
            stats.addr,
            stats.blocks_downloaded,
            stats.download_rate,
            stats.blocks_uploaded,
            stats.upload_rate,
            stats.remote_blocks
        );
        result
    }
}

/// Exchange and validate handshakes
async fn perform_handshake<S>(
    wire: &mut BitTorrentWire,
    stream: &mut S,
    peer: &mut Peer,
    ctx: &ConnectionContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Sending handshake to peer: {}", peer.addr);
    let ours = Handshake::new(ctx.info_hash, ctx.our_peer_id);
    wire.write_handshake(stream, &ours).await.map_err(|e| {
        error!("Failed to send handshake to {}: {}", peer.addr, e);
        TorrentError::peer_error_full("Failed to send handshake", peer.addr.to_string(), e.to_string())
    })?;

    debug!("Reading handshake from peer: {}", peer.addr);
    let theirs = wire.read_handshake(stream).await.map_err(|e| {
        error!("Failed to read handshake from {}: {}", peer.addr, e);
        TorrentError::peer_error_full("Failed to read handshake", peer.addr.to_string(), e.to_string())
    })?;

    theirs.validate(&ctx.info_hash, peer.peer_id.as_ref())?;
    if theirs.peer_id == ctx.our_peer_id {
        warn!("Peer {} is ourselves", peer.addr);
        return Err(TorrentError::peer_error_with_peer("Connected to ourselves", peer.addr.to_string()).into());
    }

    peer.peer_id = Some(theirs.peer_id);
    info!("Handshake completed with {} (peer id {})", peer.addr, peer.peer_id_hex());
    Ok(())
}

/// Decode frames off the read half until EOF or error
async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Result<Message>>, addr: SocketAddr)
where
    R: AsyncRead + Unpin,
{
    let mut wire = BitTorrentWire;
    loop {
        match wire.read_message(&mut reader).await {
            Ok(message) => {
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let eof = e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
                if eof {
                    debug!("Peer {} closed the stream", addr);
                } else {
                    let _ = tx.send(Err(e)).await;
                }
                break;
            }
        }
    }
}

/// Live state of an active connection
struct Session<S> {
    peer: Peer,
    ctx: ConnectionContext,
    writer: WriteHalf<S>,
    wire: BitTorrentWire,
    /// Outstanding sub-requests per block, keyed by (begin, length)
    pending: HashMap<usize, HashSet<(u32, u32)>>,
    hash_failures: u32,
    last_received: Instant,
    /// When the block in `pending` was requested
    requested_at: Instant,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn message_loop(
        &mut self,
        mut inbound: mpsc::Receiver<Result<Message>>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<()> {
        let bitfield = self.ctx.store.bitfield()?;
        if bitfield.any() {
            self.send(Message::Bitfield { bitfield: bitfield.to_bytes() }).await?;
        }
        self.update_interest().await?;

        let period = self.ctx.config.keepalive();
        let idle = self.ctx.config.idle();
        let request_timeout = self.ctx.config.request();
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Ok(message)) => {
                        self.last_received = Instant::now();
                        self.handle(message).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                command = commands.recv() => match command {
                    Some(PeerCommand::Send(message)) => {
                        let sent_have = matches!(message, Message::Have { .. });
                        self.send(message).await?;
                        if sent_have {
                            self.update_interest().await?;
                        }
                    }
                    Some(PeerCommand::Close) | None => {
                        debug!("Closing connection to {} on request", self.peer.addr);
                        return Ok(());
                    }
                },
                _ = keepalive.tick() => {
                    if self.last_received.elapsed() >= idle {
                        warn!("Peer {} idle for {:?}", self.peer.addr, self.last_received.elapsed());
                        return Err(TorrentError::peer_error_with_peer("Idle timeout", self.peer.addr.to_string()).into());
                    }
                    if !self.pending.is_empty() && self.requested_at.elapsed() >= request_timeout {
                        warn!("Peer {} left a request unanswered for {:?}", self.peer.addr, self.requested_at.elapsed());
                        return Err(TorrentError::peer_error_with_peer("Request timeout", self.peer.addr.to_string()).into());
                    }
                    trace!("Sending KeepAlive to peer: {}", self.peer.addr);
                    self.send(Message::KeepAlive).await?;
                }
            }
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        trace!("Sending {:?} to peer: {}", message.message_id(), self.peer.addr);
        let addr = self.peer.addr;
        self.wire.write_message(&mut self.writer, &message).await.map_err(|e| {
            debug!("Failed to send message to {}: {}", addr, e);
            anyhow::Error::from(TorrentError::peer_error_full("Failed to send message", addr.to_string(), e.to_string()))
        })?;

        match message {
            Message::Choke => self.peer.am_choking = true,
            Message::Unchoke => self.peer.am_choking = false,
            Message::Piece { .. } => self.peer.blocks_uploaded += 1,
            _ => {}
        }
        Ok(())
    }

    fn protocol_violation(&self, message: impl Into<String>, detail: impl Into<String>) -> anyhow::Error {
        let message = message.into();
        error!("Protocol violation by {}: {}", self.peer.addr, message);
        TorrentError::protocol_error_with_source(message, detail).into()
    }

    async fn handle(&mut self, message: Message) -> Result<()> {
        let addr = self.peer.addr;
        match message {
            Message::KeepAlive => {
                trace!("KeepAlive from {}", addr);
            }
            Message::Choke => {
                debug!("Choked by {}", addr);
                self.peer.peer_choking = true;
                self.pending.clear();
                let _ = self.ctx.events.send(SwarmEvent::ChokeChanged { addr, choked: true });
            }
            Message::Unchoke => {
                debug!("Unchoked by {}", addr);
                self.peer.peer_choking = false;
                let _ = self.ctx.events.send(SwarmEvent::ChokeChanged { addr, choked: false });
                if self.peer.am_interested {
                    self.request_block().await?;
                }
            }
            Message::Interested => {
                debug!("Peer {} is interested", addr);
                self.peer.peer_interested = true;
                if self.ctx.config.auto_unchoke && self.peer.am_choking {
                    self.send(Message::Unchoke).await?;
                    self.peer.am_choking = false;
                }
            }
            Message::NotInterested => {
                debug!("Peer {} is not interested", addr);
                self.peer.peer_interested = false;
            }
            Message::Have { piece_index } => {
                let index = piece_index as usize;
                if !self.peer.bitfield.set(index, true) {
                    return Err(self.protocol_violation("Have index out of range", format!("index: {}", piece_index)));
                }
                trace!("Peer {} has block {}", addr, index);
                self.update_interest().await?;
                self.request_block().await?;
            }
            Message::Bitfield { bitfield } => {
                self.peer.bitfield = Bitfield::from_bytes(&bitfield, self.ctx.store.num_blocks());
                debug!("Peer {} has {} blocks", addr, self.peer.bitfield.count());
                self.update_interest().await?;
                self.request_block().await?;
            }
            Message::Request { index, begin, length } => {
                self.serve_request(index, begin, length).await?;
            }
            Message::Piece { index, begin, block } => {
                self.receive_piece(index as usize, begin, block).await?;
            }
            Message::Cancel { index, begin, length } => {
                debug!("Cancel from {}: index={}, begin={}, length={}", addr, index, begin, length);
            }
            Message::Port { listen_port } => {
                debug!("Peer {} listens on port {}", addr, listen_port);
            }
        }
        Ok(())
    }

    async fn serve_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let addr = self.peer.addr;
        if length > self.ctx.config.max_request_len {
            return Err(self.protocol_violation(
                "Request too large",
                format!("{} bytes exceeds {}", length, self.ctx.config.max_request_len),
            ));
        }

        if self.peer.am_choking {
            debug!("Ignoring request from choked peer {}", addr);
            return Ok(());
        }

        let block_index = index as usize;
        if !self.ctx.store.has_block(block_index) {
            debug!("Ignoring request from {} for block {} we do not have", addr, index);
            return Ok(());
        }

        match self.ctx.store.read(block_index, begin as u64, length as u64) {
            Ok(block) => {
                trace!("Serving block {} offset {} ({} bytes) to {}", index, begin, length, addr);
                self.peer.upload_rate.record(block.len() as u64);
                self.send(Message::Piece { index, begin, block }).await?;
            }
            Err(e) => {
                warn!("Ignoring invalid request from {}: {}", addr, e);
            }
        }
        Ok(())
    }

    async fn receive_piece(&mut self, index: usize, begin: u32, block: Vec<u8>) -> Result<()> {
        let addr = self.peer.addr;
        let key = (begin, block.len() as u32);

        let Some(outstanding) = self.pending.get_mut(&index) else {
            debug!("Ignoring unrequested data for block {} from {}", index, addr);
            return Ok(());
        };
        if !outstanding.remove(&key) {
            debug!("Ignoring unrequested range {:?} of block {} from {}", key, index, addr);
            return Ok(());
        }
        let finished = outstanding.is_empty();
        self.peer.download_rate.record(block.len() as u64);

        let already_valid = self.ctx.store.has_block(index);
        if !already_valid {
            self.ctx.store.write(index, begin as u64, &block)?;
        }
        if !finished {
            return Ok(());
        }

        self.pending.remove(&index);
        if already_valid {
            debug!("Block {} from {} was completed elsewhere", index, addr);
        } else if self.ctx.store.verify_block(index, false)? {
            self.peer.blocks_downloaded += 1;
            info!("Block {} completed from {}", index, addr);
            let _ = self.ctx.events.send(SwarmEvent::BlockCompleted { index, from: addr });
        } else {
            self.hash_failures += 1;
            warn!(
                "Block {} from {} failed verification ({}/{})",
                index, addr, self.hash_failures, self.ctx.config.max_hash_failures
            );
            if self.hash_failures >= self.ctx.config.max_hash_failures {
                return Err(TorrentError::peer_error_with_peer("Too many hash failures", addr.to_string()).into());
            }
        }

        self.update_interest().await?;
        self.request_block().await
    }

    /// Blocks the remote has and we lack
    fn desired_blocks(&self) -> Vec<usize> {
        self.peer
            .bitfield
            .ones()
            .filter(|&i| !self.ctx.store.has_block(i))
            .collect()
    }

    fn in_endgame(&self) -> bool {
        !self.ctx.store.is_complete() && self.ctx.store.missing_fraction() < self.ctx.config.endgame_threshold
    }

    /// Send Interested or NotInterested when the policy changes
    async fn update_interest(&mut self) -> Result<()> {
        let want = !self.desired_blocks().is_empty() || self.in_endgame();
        if want && !self.peer.am_interested {
            debug!("Interested in {}", self.peer.addr);
            self.send(Message::Interested).await?;
            self.peer.am_interested = true;
        } else if !want && self.peer.am_interested {
            debug!("No longer interested in {}", self.peer.addr);
            self.send(Message::NotInterested).await?;
            self.peer.am_interested = false;
        }
        Ok(())
    }

    /// Request a random desired block, tiled into chunk-sized requests
    ///
    /// One block is in flight per connection at a time.
    async fn request_block(&mut self) -> Result<()> {
        if !self.pending.is_empty() || !self.peer.can_request() {
            return Ok(());
        }

        let candidates: Vec<usize> = self
            .desired_blocks()
            .into_iter()
            .filter(|i| !self.pending.contains_key(i))
            .collect();
        let Some(&index) = candidates.choose(&mut rand::thread_rng()) else {
            trace!("Nothing to request from {}", self.peer.addr);
            return Ok(());
        };

        let block_len = self.ctx.store.block_len(index).unwrap_or(0);
        let chunk = self.ctx.config.request_chunk_size as u64;
        let mut requests = Vec::new();
        let mut begin = 0u64;
        while begin < block_len {
            let length = chunk.min(block_len - begin);
            requests.push((begin as u32, length as u32));
            begin += length;
        }

        debug!("Requesting block {} from {} in {} parts", index, self.peer.addr, requests.len());
        self.pending.insert(index, requests.iter().copied().collect());
        self.requested_at = Instant::now();
        for (begin, length) in requests {
            self.send(Message::Request { index: index as u32, begin, length }).await?;
        }
        Ok(())
    }
}
