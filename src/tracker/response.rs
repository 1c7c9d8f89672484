//! Tracker announce types
//!
//! Request parameters shared by both transports and the decoded response.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use tracing::{debug, warn};

use crate::bencode::Value;
use crate::error::TorrentError;
use crate::peer::{PeerInfo, PeerSource};

/// Size of one compact IPv4 peer entry
pub const COMPACT_PEER_LEN: usize = 6;

/// Announce event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

impl TrackerEvent {
    /// Query-string value; empty for a regular announce
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Completed => "completed",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
        }
    }

    /// Event field of a UDP announce
    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Parameters of a single announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
    /// Peers wanted; -1 leaves it to the tracker
    pub num_wanted: i32,
    pub compact: bool,
}

impl AnnounceRequest {
    pub fn new(peer_id: [u8; 20], port: u16, left: u64) -> Self {
        Self {
            peer_id,
            port,
            uploaded: 0,
            downloaded: 0,
            left,
            event: TrackerEvent::None,
            num_wanted: -1,
            compact: true,
        }
    }

    pub fn with_event(mut self, event: TrackerEvent) -> Self {
        self.event = event;
        self
    }
}

/// Decoded announce response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds until the next regular announce
    pub interval: u32,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub warning: Option<String>,
    pub peers: Vec<PeerInfo>,
}

impl TrackerResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            seeders: None,
            leechers: None,
            warning: None,
            peers: Vec::new(),
        }
    }

    /// Decode a bencoded HTTP announce body
    pub fn from_bencode(value: &Value) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(TorrentError::tracker_error(format!(
                "Expected dictionary response, got {}",
                value.kind()
            ))
            .into());
        }

        if let Some(failure) = value.get("failure reason") {
            let reason = failure
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            warn!("Tracker reported failure: {}", reason);
            return Err(TorrentError::tracker_error(reason).into());
        }

        let interval = value
            .get("interval")
            .and_then(Value::as_int)
            .ok_or_else(|| TorrentError::tracker_error("Missing interval"))?;
        let interval = u32::try_from(interval)
            .map_err(|_| TorrentError::tracker_error(format!("Invalid interval: {}", interval)))?;

        let mut response = TrackerResponse::new(interval);
        response.seeders = value.get("complete").and_then(count);
        response.leechers = value.get("incomplete").and_then(count);
        response.warning = value
            .get("warning message")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned());

        match value.get("peers") {
            Some(Value::Bytes(compact)) => response.peers = parse_compact_peers(compact),
            Some(Value::List(entries)) => response.peers = entries.iter().filter_map(parse_peer_entry).collect(),
            Some(other) => {
                return Err(TorrentError::tracker_error(format!("Invalid peers field: {}", other.kind())).into());
            }
            None => debug!("Tracker response carries no peers"),
        }

        Ok(response)
    }
}

fn count(value: &Value) -> Option<u32> {
    value.as_int().and_then(|n| u32::try_from(n).ok())
}

/// One `{ip, port, peer id}` entry of a non-compact peer list
fn parse_peer_entry(entry: &Value) -> Option<PeerInfo> {
    let ip: IpAddr = entry.get("ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get("port")?.as_int()?).ok()?;
    let addr = SocketAddr::new(ip, port);

    let peer_id = entry
        .get("peer id")
        .and_then(Value::as_bytes)
        .and_then(|b| <[u8; 20]>::try_from(b).ok());

    Some(match peer_id {
        Some(id) => PeerInfo::with_peer_id(addr, id, PeerSource::Tracker),
        None => PeerInfo::new(addr, PeerSource::Tracker),
    })
}

/// Decode 6-byte `ip:port` entries; a trailing partial entry is ignored
pub fn parse_compact_peers(data: &[u8]) -> Vec<PeerInfo> {
    data.chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerInfo::new(SocketAddr::new(IpAddr::V4(ip), port), PeerSource::Tracker)
        })
        .collect()
}
