//! Peer management module
//!
//! Per-peer state, the connection state machine and the swarm manager.

pub mod connection;
pub mod manager;
pub mod state;

// Re-export main types
pub use connection::{ConnectionContext, PeerCommand, PeerConnection, SwarmEvent};
pub use manager::SwarmManager;
pub use state::{Peer, PeerInfo, PeerSource, PeerState, PeerStats, RateWindow};
