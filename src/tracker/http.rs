//! HTTP tracker client

use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tracing::{debug, error, info};
use url::Url;

use super::response::{AnnounceRequest, TrackerResponse};
use crate::bencode;
use crate::error::TorrentError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Announces over HTTP(S) with a bencoded response body
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    url: Url,
    info_hash: [u8; 20],
}

impl HttpTracker {
    pub fn new(url: Url, info_hash: [u8; 20]) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build().map_err(|e| {
            error!("Failed to build HTTP client: {}", e);
            TorrentError::tracker_error_full("Failed to build HTTP client", url.as_str(), e.to_string())
        })?;
        Ok(Self::with_client(client, url, info_hash))
    }

    /// Use a preconfigured client (proxy, TLS or timeout settings)
    pub fn with_client(client: Client, url: Url, info_hash: [u8; 20]) -> Self {
        Self { client, url, info_hash }
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Full announce URL for a request
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&num_wanted={}&compact={}",
            urlencoding::encode_binary(&self.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.num_wanted,
            u8::from(request.compact),
        );
        let event = request.event.as_str();
        if !event.is_empty() {
            query.push_str("&event=");
            query.push_str(event);
        }

        let base = self.url.as_str();
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", base, separator, query)
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<TrackerResponse> {
        let url = self.announce_url(request);
        debug!("HTTP announce: {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            TorrentError::tracker_error_full("Announce request failed", self.url.as_str(), e.to_string())
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error_with_tracker(
                format!("HTTP status {}", status),
                self.url.as_str(),
            )
            .into());
        }

        let body = response.bytes().await.map_err(|e| {
            TorrentError::tracker_error_full("Failed to read announce body", self.url.as_str(), e.to_string())
        })?;
        let value = bencode::decode(&body)?;
        let parsed = TrackerResponse::from_bencode(&value)
            .map_err(|e| e.context(format!("tracker {}", self.url)))?;

        info!(
            "Tracker {} returned {} peers (interval {}s)",
            self.url,
            parsed.peers.len(),
            parsed.interval
        );
        Ok(parsed)
    }
}
