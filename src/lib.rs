//! swarm-torrent
//!
//! A BitTorrent swarm client: bencode codec, piece store, peer wire protocol,
//! HTTP/UDP tracker client and a swarm manager tying them together.

pub mod bencode;
pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use cli::CliArgs;
pub use config::ClientConfig;
pub use peer::{ConnectionContext, Peer, PeerCommand, PeerConnection, PeerInfo, PeerSource, PeerState, SwarmEvent, SwarmManager};
pub use protocol::{Bitfield, Handshake, Message, MessageId};
pub use storage::{DiskProvider, FileProvider, PieceStatus, PieceStore};
pub use torrent::{TorrentInfo, TorrentParser};
pub use tracker::{AnnounceRequest, Tracker, TrackerEvent, TrackerResponse};
