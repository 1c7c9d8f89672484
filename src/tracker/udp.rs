//! UDP tracker client
//!
//! Binary announce/scrape exchange over a datagram channel. Requests are
//! matched to responses by transaction id; an unanswered request is resent
//! with exponential backoff. Connection ids are refreshed once they expire.
//!
//! There is no background receiver: whichever transaction currently holds
//! the receive lock reads the next datagram and hands responses belonging
//! to other transactions over their oneshot channels.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{oneshot, OnceCell};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, trace, warn};

use super::response::{parse_compact_peers, AnnounceRequest, TrackerResponse};
use crate::error::TorrentError;

/// Connection id sent with CONNECT requests
pub const PROTOCOL_MAGIC: u64 = 0x41727101980;
pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_SCRAPE: u32 = 2;
pub const ACTION_ERROR: u32 = 3;

/// Lifetime of a connection id
pub const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);
/// Wait before the first resend; doubles on each attempt
pub const RETRY_BASE: Duration = Duration::from_secs(15);
/// Attempts before a transaction fails
pub const MAX_ATTEMPTS: u32 = 9;

const MAX_DATAGRAM: usize = 2048;
const RESPONSE_HEADER_LEN: usize = 8;

/// A connected datagram transport
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive one datagram; must be cancel-safe
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}

/// `UdpSocket` bound and connected on first use
pub struct UdpChannel {
    remote: String,
    socket: OnceCell<UdpSocket>,
}

impl UdpChannel {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            socket: OnceCell::new(),
        }
    }

    async fn socket(&self) -> Result<&UdpSocket> {
        self.socket
            .get_or_try_init(|| async {
                let remote = lookup_host(&self.remote)
                    .await
                    .map_err(|e| {
                        TorrentError::network_error_full("Failed to resolve tracker", self.remote.clone(), e.to_string())
                    })?
                    .next()
                    .ok_or_else(|| {
                        TorrentError::network_error_with_address("Tracker host has no addresses", self.remote.clone())
                    })?;

                let socket = UdpSocket::bind(local_addr_for(&remote)).await?;
                socket.connect(remote).await.map_err(|e| {
                    TorrentError::network_error_full("Failed to connect UDP socket", remote.to_string(), e.to_string())
                })?;
                debug!("UDP tracker socket connected to {} ({})", self.remote, remote);
                Ok::<_, anyhow::Error>(socket)
            })
            .await
    }
}

/// Wildcard address of the same family as `remote`
fn local_addr_for(remote: &SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.socket().await?.send(data).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket().await?.recv(buf).await?)
    }
}

type PendingTable = Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<Vec<u8>>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An outstanding request; its table entry goes away when this is dropped
struct Transaction<'a> {
    id: u32,
    pending: &'a PendingTable,
    response: oneshot::Receiver<Vec<u8>>,
}

impl<'a> Transaction<'a> {
    fn open(pending: &'a PendingTable) -> Self {
        let (tx, response) = oneshot::channel();
        let mut table = lock(pending);
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate: u32 = rng.gen();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };
        table.insert(id, tx);
        Self { id, pending, response }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

/// Seeders, completed downloads and leechers for one info hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {
    pub seeders: u32,
    pub completed: u32,
    pub leechers: u32,
}

pub struct UdpTracker {
    url: String,
    info_hash: [u8; 20],
    channel: Arc<dyn DatagramChannel>,
    /// Sent with every announce
    key: u32,
    connection: Mutex<Option<(u64, Instant)>>,
    pending: PendingTable,
    recv_lock: tokio::sync::Mutex<()>,
}

impl UdpTracker {
    /// Tracker reached at `host:port`; the socket is opened on first use
    pub fn new(url: impl Into<String>, remote: impl Into<String>, info_hash: [u8; 20]) -> Self {
        Self::with_channel(url, Arc::new(UdpChannel::new(remote)), info_hash)
    }

    pub fn with_channel(url: impl Into<String>, channel: Arc<dyn DatagramChannel>, info_hash: [u8; 20]) -> Self {
        Self {
            url: url.into(),
            info_hash,
            channel,
            key: rand::thread_rng().gen(),
            connection: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            recv_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<TrackerResponse> {
        let connection_id = self.connection_id().await?;

        let mut payload = Vec::with_capacity(82);
        payload.extend_from_slice(&self.info_hash);
        payload.extend_from_slice(&request.peer_id);
        payload.extend_from_slice(&request.downloaded.to_be_bytes());
        payload.extend_from_slice(&request.left.to_be_bytes());
        payload.extend_from_slice(&request.uploaded.to_be_bytes());
        payload.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&self.key.to_be_bytes());
        payload.extend_from_slice(&request.num_wanted.to_be_bytes());
        payload.extend_from_slice(&request.port.to_be_bytes());

        let body = self.transact(connection_id, ACTION_ANNOUNCE, &payload).await?;
        if body.len() < 12 {
            return Err(self.invalid(format!("announce response of {} bytes", body.len())));
        }

        let mut response = TrackerResponse::new(be_u32(&body[0..4]));
        response.leechers = Some(be_u32(&body[4..8]));
        response.seeders = Some(be_u32(&body[8..12]));
        response.peers = parse_compact_peers(&body[12..]);

        debug!(
            "UDP tracker {} returned {} peers (interval {}s)",
            self.url,
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }

    /// Swarm counters for each of `info_hashes`, in order
    pub async fn scrape(&self, info_hashes: &[[u8; 20]]) -> Result<Vec<ScrapeStats>> {
        let connection_id = self.connection_id().await?;
        let payload = info_hashes.concat();

        let body = self.transact(connection_id, ACTION_SCRAPE, &payload).await?;
        if body.len() < info_hashes.len() * 12 {
            return Err(self.invalid(format!(
                "scrape response of {} bytes for {} hashes",
                body.len(),
                info_hashes.len()
            )));
        }

        Ok(body
            .chunks_exact(12)
            .take(info_hashes.len())
            .map(|entry| ScrapeStats {
                seeders: be_u32(&entry[0..4]),
                completed: be_u32(&entry[4..8]),
                leechers: be_u32(&entry[8..12]),
            })
            .collect())
    }

    /// Current connection id, reconnecting when missing or expired
    async fn connection_id(&self) -> Result<u64> {
        let cached = *self.connection.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((id, issued)) = cached {
            if issued.elapsed() < CONNECTION_ID_TTL {
                return Ok(id);
            }
            debug!("Connection id for {} expired", self.url);
        }

        let body = self.transact(PROTOCOL_MAGIC, ACTION_CONNECT, &[]).await?;
        if body.len() < 8 {
            return Err(self.invalid("connect response too short"));
        }
        let id = u64::from_be_bytes([body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7]]);
        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = Some((id, Instant::now()));
        trace!("Connection id {:#x} from {}", id, self.url);
        Ok(id)
    }

    /// Send a request until its response arrives; returns the body after the header
    async fn transact(&self, connection_id: u64, action: u32, payload: &[u8]) -> Result<Vec<u8>> {
        let mut transaction = Transaction::open(&self.pending);

        let mut request = Vec::with_capacity(16 + payload.len());
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&action.to_be_bytes());
        request.extend_from_slice(&transaction.id.to_be_bytes());
        request.extend_from_slice(payload);

        for attempt in 0..MAX_ATTEMPTS {
            self.channel.send(&request).await?;
            let wait = RETRY_BASE * 2u32.pow(attempt);
            trace!("Sent action {} to {} (attempt {}, waiting {:?})", action, self.url, attempt + 1, wait);

            match timeout(wait, self.await_response(&mut transaction)).await {
                Ok(response) => return self.check_response(response?, action),
                Err(_) => debug!("No response from {} after {:?}", self.url, wait),
            }
        }

        warn!("Tracker {} did not answer after {} attempts", self.url, MAX_ATTEMPTS);
        Err(TorrentError::network_error_with_address("Tracker timed out", self.url.clone()).into())
    }

    async fn await_response(&self, transaction: &mut Transaction<'_>) -> Result<Vec<u8>> {
        loop {
            tokio::select! {
                biased;
                delivered = &mut transaction.response => {
                    return delivered.map_err(|_| TorrentError::tracker_error_with_tracker("Transaction dropped", self.url.clone()).into());
                }
                datagram = self.read_datagram() => {
                    if let Some(mine) = self.route(datagram?, transaction.id) {
                        return Ok(mine);
                    }
                }
            }
        }
    }

    async fn read_datagram(&self) -> Result<Vec<u8>> {
        let _guard = self.recv_lock.lock().await;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.channel.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Hand a datagram to its transaction; returns it if it is ours
    fn route(&self, datagram: Vec<u8>, ours: u32) -> Option<Vec<u8>> {
        if datagram.len() < RESPONSE_HEADER_LEN {
            debug!("Dropping runt datagram of {} bytes from {}", datagram.len(), self.url);
            return None;
        }
        let id = be_u32(&datagram[4..8]);
        if id == ours {
            return Some(datagram);
        }

        match lock(&self.pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(datagram);
            }
            None => debug!("Dropping response for unknown transaction {:#x} from {}", id, self.url),
        }
        None
    }

    fn check_response(&self, datagram: Vec<u8>, expected: u32) -> Result<Vec<u8>> {
        let action = be_u32(&datagram[0..4]);
        let body = datagram[RESPONSE_HEADER_LEN..].to_vec();

        if action == ACTION_ERROR {
            let message = String::from_utf8_lossy(&body).into_owned();
            warn!("Tracker {} returned error: {}", self.url, message);
            return Err(TorrentError::tracker_error_with_tracker(message, self.url.clone()).into());
        }
        if action != expected {
            return Err(self.invalid(format!("expected action {}, got {}", expected, action)));
        }
        Ok(body)
    }

    fn invalid(&self, detail: impl Into<String>) -> anyhow::Error {
        TorrentError::tracker_error_full("Invalid UDP response", self.url.clone(), detail).into()
    }
}

impl std::fmt::Debug for UdpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTracker").field("url", &self.url).field("key", &self.key).finish()
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
