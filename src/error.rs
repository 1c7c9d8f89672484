//! Error types for the swarm client
//!
//! Every component reports failures through [`TorrentError`]. Fallible
//! functions return `anyhow::Result`, so callers that need the category
//! use `downcast_ref::<TorrentError>()`.

use std::fmt;

/// Error type for swarm operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode or torrent metadata parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Piece store and file I/O errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce/scrape errors
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: None,
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL
    pub fn tracker_error_with_tracker(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker URL and source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { source, .. }
            | TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::StorageError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }

    /// Whether this error is a protocol violation by the remote side
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, TorrentError::ProtocolError { .. })
    }
}

impl TorrentError {
    fn label(&self) -> &'static str {
        match self {
            TorrentError::ParseError { .. } => "Parse error",
            TorrentError::ProtocolError { .. } => "Protocol error",
            TorrentError::PeerError { .. } => "Peer error",
            TorrentError::StorageError { .. } => "Storage error",
            TorrentError::TrackerError { .. } => "Tracker error",
            TorrentError::ConfigError { .. } => "Config error",
            TorrentError::NetworkError { .. } => "Network error",
            TorrentError::ValidationError { .. } => "Validation error",
        }
    }

    /// The message plus whichever detail fields are set, in display order
    fn parts(&self) -> (&str, [(&'static str, Option<&str>); 2]) {
        match self {
            TorrentError::ParseError { message, source } | TorrentError::ProtocolError { message, source } => {
                (message.as_str(), [("source", source.as_deref()), ("", None)])
            }
            TorrentError::PeerError { message, peer, source } => {
                (message.as_str(), [("peer", peer.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::StorageError { message, path, source } => {
                (message.as_str(), [("path", path.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::TrackerError { message, tracker, source } => {
                (message.as_str(), [("tracker", tracker.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::NetworkError { message, address, source } => {
                (message.as_str(), [("address", address.as_deref()), ("source", source.as_deref())])
            }
            TorrentError::ConfigError { message, field } | TorrentError::ValidationError { message, field } => {
                (message.as_str(), [("field", field.as_deref()), ("", None)])
            }
        }
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (message, details) = self.parts();
        write!(f, "{}: {}", self.label(), message)?;

        let mut set = details.iter().filter_map(|(name, value)| value.map(|v| (name, v))).peekable();
        if set.peek().is_none() {
            return Ok(());
        }
        f.write_str(" (")?;
        for (i, (name, value)) in set.enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::config_error_with_field(format!("Invalid tracker URL: {}", err), "announce")
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        let tracker = err.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
        TorrentError::tracker_error_full("HTTP announce failed", tracker, err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
