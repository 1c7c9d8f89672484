//! Peer state module
//!
//! Per-peer identity, protocol flags and transfer statistics.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::protocol::Bitfield;

/// Span of the rolling transfer-rate window
pub const RATE_WINDOW: Duration = Duration::from_secs(20);

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Opening the transport
    #[default]
    Connecting,
    /// Exchanging handshakes
    Handshaking,
    /// Handshake done; message loop running
    Active,
    /// Stream closed or connection failed
    Closed,
}

impl PeerState {
    pub fn is_active(&self) -> bool {
        matches!(self, PeerState::Active)
    }
}

/// Where the peer was discovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Incoming,
    Manual,
}

/// A peer address as learned from a tracker or the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub source: PeerSource,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self { addr, peer_id: None, source }
    }

    pub fn with_peer_id(addr: SocketAddr, peer_id: [u8; 20], source: PeerSource) -> Self {
        Self { addr, peer_id: Some(peer_id), source }
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> Option<String> {
        self.peer_id.map(hex::encode)
    }
}

/// Rolling byte counter over the last [`RATE_WINDOW`]
#[derive(Debug, Clone, Default)]
pub struct RateWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl RateWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` transferred now
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.expire(now);
    }

    /// Bytes transferred within the window
    pub fn total(&mut self) -> u64 {
        self.expire(Instant::now());
        self.samples.iter().map(|(_, b)| b).sum()
    }

    /// Average bytes per second over the window
    pub fn rate(&mut self) -> f64 {
        self.total() as f64 / RATE_WINDOW.as_secs_f64()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A remote peer and its protocol state
///
/// Equality and hashing use the address only.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier, once known
    pub peer_id: Option<[u8; 20]>,
    /// Current state
    pub state: PeerState,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Blocks they have
    pub bitfield: Bitfield,
    /// Blocks downloaded from this peer
    pub blocks_downloaded: u32,
    /// Blocks uploaded to this peer
    pub blocks_uploaded: u32,
    /// Incoming payload bytes
    pub download_rate: RateWindow,
    /// Outgoing payload bytes
    pub upload_rate: RateWindow,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            state: PeerState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::default(),
            blocks_downloaded: 0,
            blocks_uploaded: 0,
            download_rate: RateWindow::new(),
            upload_rate: RateWindow::new(),
        }
    }

    pub fn with_peer_id(addr: SocketAddr, peer_id: [u8; 20]) -> Self {
        let mut peer = Self::new(addr);
        peer.peer_id = Some(peer_id);
        peer
    }

    /// Whether block requests may be sent
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested && self.state.is_active()
    }

    pub fn has_block(&self, index: usize) -> bool {
        self.bitfield.get(index)
    }

    pub fn set_state(&mut self, state: PeerState) {
        self.state = state;
    }

    pub fn peer_id_hex(&self) -> String {
        self.peer_id.map(hex::encode).unwrap_or_else(|| "unknown".to_string())
    }

    /// Snapshot of the peer's counters
    pub fn stats(&mut self) -> PeerStats {
        PeerStats {
            addr: self.addr,
            state: self.state,
            blocks_downloaded: self.blocks_downloaded,
            blocks_uploaded: self.blocks_uploaded,
            download_rate: self.download_rate.rate(),
            upload_rate: self.upload_rate.rate(),
            remote_blocks: self.bitfield.count(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

/// Peer statistics
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub blocks_downloaded: u32,
    pub blocks_uploaded: u32,
    /// Bytes per second over the rate window
    pub download_rate: f64,
    pub upload_rate: f64,
    /// Blocks the peer has announced
    pub remote_blocks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr() -> SocketAddr {
        "127.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_peer_new() {
        let peer = Peer::new(addr());
        assert_eq!(peer.addr, addr());
        assert!(peer.peer_id.is_none());
        assert_eq!(peer.state, PeerState::Connecting);
        assert!(peer.am_choking);
        assert!(!peer.am_interested);
        assert!(peer.peer_choking);
        assert!(!peer.peer_interested);
        assert_eq!(peer.peer_id_hex(), "unknown");
    }

    #[test]
    fn test_identity_is_address() {
        let a = Peer::with_peer_id(addr(), [1u8; 20]);
        let b = Peer::with_peer_id(addr(), [2u8; 20]);
        assert_eq!(a, b);

        let set: HashSet<Peer> = [a, b, Peer::new("127.0.0.1:6882".parse().unwrap())].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_can_request() {
        let mut peer = Peer::new(addr());
        assert!(!peer.can_request());

        peer.set_state(PeerState::Active);
        assert!(!peer.can_request());

        peer.peer_choking = false;
        assert!(!peer.can_request());

        peer.am_interested = true;
        assert!(peer.can_request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_expires() {
        let mut window = RateWindow::new();
        window.record(1000);
        tokio::time::advance(Duration::from_secs(10)).await;
        window.record(1000);
        assert_eq!(window.total(), 2000);
        assert_eq!(window.rate(), 100.0);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(window.total(), 1000);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(window.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let mut peer = Peer::new(addr());
        peer.bitfield = Bitfield::from(vec![true, false, true]);
        peer.download_rate.record(40_000);
        peer.upload_rate.record(2_000);
        peer.blocks_downloaded = 1;

        let stats = peer.stats();
        assert_eq!(stats.addr, addr());
        assert_eq!(stats.remote_blocks, 2);
        assert_eq!(stats.state, PeerState::Connecting);
        assert_eq!(stats.blocks_downloaded, 1);
        assert_eq!(stats.download_rate, 2_000.0);
        assert_eq!(stats.upload_rate, 100.0);

        tokio::time::advance(RATE_WINDOW + Duration::from_secs(1)).await;
        assert_eq!(peer.stats().download_rate, 0.0);
    }
}
