//! Tracker client module
//!
//! Peer discovery through HTTP and UDP trackers.

pub mod http;
pub mod response;
pub mod udp;

use anyhow::Result;
use tracing::{debug, error};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::TorrentInfo;

pub use http::HttpTracker;
pub use response::{parse_compact_peers, AnnounceRequest, TrackerEvent, TrackerResponse};
pub use udp::{DatagramChannel, ScrapeStats, UdpChannel, UdpTracker};

/// Transport chosen from the announce URL scheme
#[derive(Debug)]
pub enum TrackerKind {
    Http(HttpTracker),
    Udp(UdpTracker),
}

/// One announce URL of a torrent
#[derive(Debug)]
pub struct Tracker {
    kind: TrackerKind,
    tier: usize,
}

impl Tracker {
    /// Tracker for `url`; fails for any scheme other than http, https or udp
    pub fn new(url: &str, torrent: &TorrentInfo) -> Result<Self> {
        Self::with_tier(url, torrent, 0)
    }

    pub fn with_tier(url: &str, torrent: &TorrentInfo, tier: usize) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            error!("Invalid tracker URL '{}': {}", url, e);
            TorrentError::config_error_with_field(format!("Invalid tracker URL '{}': {}", url, e), "announce")
        })?;

        let kind = match parsed.scheme() {
            "http" | "https" => TrackerKind::Http(HttpTracker::new(parsed, torrent.info_hash)?),
            "udp" => {
                let host = parsed.host_str().ok_or_else(|| {
                    TorrentError::config_error_with_field(format!("Tracker URL '{}' has no host", url), "announce")
                })?;
                let port = parsed.port().ok_or_else(|| {
                    TorrentError::config_error_with_field(format!("Tracker URL '{}' has no port", url), "announce")
                })?;
                TrackerKind::Udp(UdpTracker::new(url, format!("{}:{}", host, port), torrent.info_hash))
            }
            other => {
                return Err(TorrentError::config_error_with_field(
                    format!("Unsupported tracker protocol: {}", other),
                    "announce",
                )
                .into());
            }
        };

        debug!("Tracker {} (tier {})", url, tier);
        Ok(Self { kind, tier })
    }

    /// Trackers for every announce URL of a torrent; unusable URLs are skipped
    pub fn for_torrent(torrent: &TorrentInfo) -> Vec<Self> {
        torrent
            .trackers()
            .into_iter()
            .filter_map(|(tier, url)| match Self::with_tier(&url, torrent, tier) {
                Ok(tracker) => Some(tracker),
                Err(e) => {
                    error!("Skipping tracker {}: {}", url, e);
                    None
                }
            })
            .collect()
    }

    pub fn url(&self) -> &str {
        match &self.kind {
            TrackerKind::Http(t) => t.url(),
            TrackerKind::Udp(t) => t.url(),
        }
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn kind(&self) -> &TrackerKind {
        &self.kind
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<TrackerResponse> {
        debug!("Announcing to {} (event {:?}, left {})", self.url(), request.event, request.left);
        match &self.kind {
            TrackerKind::Http(t) => t.announce(request).await,
            TrackerKind::Udp(t) => t.announce(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(announce: &str, announce_list: Vec<Vec<String>>) -> TorrentInfo {
        TorrentInfo {
            announce: announce.to_string(),
            announce_list,
            info_hash: [0u8; 20],
            piece_length: 16384,
            pieces: vec![[0u8; 20]],
            name: "test".to_string(),
            length: Some(100),
            files: None,
        }
    }

    #[test]
    fn test_dispatch_on_scheme() {
        let info = torrent("", Vec::new());

        let http = Tracker::new("http://tracker.example/announce", &info).unwrap();
        assert!(matches!(http.kind(), TrackerKind::Http(_)));

        let https = Tracker::new("https://tracker.example/announce", &info).unwrap();
        assert!(matches!(https.kind(), TrackerKind::Http(_)));

        let udp = Tracker::new("udp://tracker.example:1337/announce", &info).unwrap();
        assert!(matches!(udp.kind(), TrackerKind::Udp(_)));
        assert_eq!(udp.url(), "udp://tracker.example:1337/announce");
    }

    #[test]
    fn test_unsupported_scheme_is_config_error() {
        let info = torrent("", Vec::new());
        for url in ["wss://tracker.example/announce", "tracker.example/announce"] {
            let err = Tracker::new(url, &info).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<TorrentError>(),
                Some(TorrentError::ConfigError { .. })
            ));
        }
    }

    #[test]
    fn test_for_torrent_keeps_tiers() {
        let info = torrent(
            "http://a.example/announce",
            vec![
                vec!["http://a.example/announce".to_string(), "udp://b.example:80".to_string()],
                vec!["gopher://c.example".to_string(), "https://d.example/announce".to_string()],
            ],
        );

        let trackers = Tracker::for_torrent(&info);
        let summary: Vec<(usize, &str)> = trackers.iter().map(|t| (t.tier(), t.url())).collect();
        assert_eq!(
            summary,
            vec![
                (0, "http://a.example/announce"),
                (0, "udp://b.example:80"),
                (1, "https://d.example/announce"),
            ]
        );
    }
}
