//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use tracing::{debug, error, info, trace, warn};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(|e| {
            error!("Torrent file is not valid bencode: {}", e);
            e
        })?;
        Self::parse_value(&root)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    /// Build torrent metadata from an already decoded root dictionary
    pub fn parse_value(root: &Value) -> Result<TorrentInfo> {
        if root.as_dict().is_none() {
            return Err(TorrentError::parse_error_with_source("Root must be a dictionary", root.kind()).into());
        }

        let announce = root
            .get("announce")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .unwrap_or_default();

        let mut announce_list = Vec::new();
        if let Some(tiers) = root.get("announce-list").and_then(Value::as_list) {
            for tier in tiers {
                let Some(urls) = tier.as_list() else {
                    warn!("Skipping malformed announce-list tier");
                    continue;
                };
                let urls: Vec<String> = urls
                    .iter()
                    .filter_map(Value::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).to_string())
                    .collect();
                if !urls.is_empty() {
                    announce_list.push(urls);
                }
            }
        }

        if announce.is_empty() && announce_list.is_empty() {
            return Err(TorrentError::parse_error("Missing announce field").into());
        }

        let info_value = root
            .get("info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;

        let name = info_value
            .get("name")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).to_string())
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;
        // name becomes the file (or root directory) created under the download dir
        Self::check_path_component(&name)?;

        let piece_length = Self::positive_int(info_value, "piece length")?;
        if piece_length == 0 {
            return Err(TorrentError::parse_error_with_source("Invalid piece length", "must be positive").into());
        }

        let pieces_bytes = info_value
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = if info_value.get("length").is_some() {
            (Some(Self::positive_int(info_value, "length")?), None)
        } else if let Some(file_list) = info_value.get("files").and_then(Value::as_list) {
            let mut torrent_files = Vec::with_capacity(file_list.len());
            for entry in file_list {
                torrent_files.push(Self::parse_file_entry(entry)?);
            }
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        // info hash is computed over the canonical encoding of the info value
        let info_hash = TorrentInfo::generate_info_hash(&bencode::encode(info_value));

        let torrent = TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
            files,
        };

        let expected_pieces = torrent.total_size().div_ceil(piece_length);
        if expected_pieces != torrent.piece_count() as u64 {
            return Err(TorrentError::parse_error_with_source(
                "Piece count does not match content size",
                format!("expected {}, got {}", expected_pieces, torrent.piece_count()),
            )
            .into());
        }

        info!(
            "Parsed torrent '{}' ({} bytes, {} pieces, info hash {})",
            torrent.name,
            torrent.total_size(),
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    fn parse_file_entry(entry: &Value) -> Result<TorrentFile> {
        let length = Self::positive_int(entry, "length")?;

        let components = entry
            .get("path")
            .and_then(Value::as_list)
            .ok_or_else(|| TorrentError::parse_error("Missing file path"))?;

        let mut path = Vec::with_capacity(components.len());
        for component in components {
            let text = component
                .as_bytes()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .ok_or_else(|| TorrentError::parse_error("File path component is not a string"))?;
            Self::check_path_component(&text)?;
            path.push(text);
        }
        if path.is_empty() {
            return Err(TorrentError::parse_error("Empty file path").into());
        }

        Ok(TorrentFile { path, length })
    }

    /// Reject components that would resolve outside the download directory
    fn check_path_component(text: &str) -> Result<()> {
        if text.is_empty() || text == "." || text == ".." || text.contains('/') || text.contains('\\') {
            warn!("Rejecting unsafe path component {:?}", text);
            return Err(TorrentError::parse_error_with_source("Unsafe file path component", text).into());
        }
        Ok(())
    }

    fn positive_int(dict: &Value, key: &str) -> Result<u64> {
        let n = dict
            .get(key)
            .and_then(Value::as_int)
            .ok_or_else(|| TorrentError::parse_error(format!("Missing {} field", key)))?;
        u64::try_from(n).map_err(|_| {
            TorrentError::parse_error_with_source(format!("Invalid {} field", key), format!("value: {}", n)).into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_dict(length: i64, piece_length: i64, pieces: usize) -> Value {
        Value::dict(vec![
            ("name", Value::from("file.bin")),
            ("piece length", Value::Integer(piece_length)),
            ("pieces", Value::Bytes(vec![7u8; 20 * pieces])),
            ("length", Value::Integer(length)),
        ])
    }

    fn torrent_bytes(info: Value) -> Vec<u8> {
        bencode::encode(&Value::dict(vec![
            ("announce", Value::from("udp://tracker.example.com:80")),
            ("info", info),
        ]))
    }

    #[test]
    fn test_parse_single_file() {
        let torrent = TorrentParser::parse_bytes(&torrent_bytes(info_dict(100, 64, 2))).unwrap();
        assert_eq!(torrent.name, "file.bin");
        assert_eq!(torrent.total_size(), 100);
        assert_eq!(torrent.piece_length, 64);
        assert_eq!(torrent.piece_count(), 2);
        assert_eq!(torrent.announce, "udp://tracker.example.com:80");
    }

    #[test]
    fn test_info_hash_is_sha1_of_encoded_info() {
        let info = info_dict(100, 64, 2);
        let expected = TorrentInfo::generate_info_hash(&bencode::encode(&info));
        let torrent = TorrentParser::parse_bytes(&torrent_bytes(info)).unwrap();
        assert_eq!(torrent.info_hash, expected);
    }

    #[test]
    fn test_parse_multi_file() {
        let info = Value::dict(vec![
            ("name", Value::from("dir")),
            ("piece length", Value::Integer(16)),
            ("pieces", Value::Bytes(vec![0u8; 40])),
            (
                "files",
                Value::List(vec![
                    Value::dict(vec![
                        ("length", Value::Integer(10)),
                        ("path", Value::list(vec!["a.txt"])),
                    ]),
                    Value::dict(vec![
                        ("length", Value::Integer(12)),
                        ("path", Value::list(vec!["sub", "b.txt"])),
                    ]),
                ]),
            ),
        ]);
        let torrent = TorrentParser::parse_bytes(&torrent_bytes(info)).unwrap();
        assert!(torrent.is_multi_file());
        assert_eq!(torrent.total_size(), 22);
        let files: Vec<_> = torrent.files_iter().collect();
        assert_eq!(files[0].path, vec!["a.txt"]);
        assert_eq!(files[1].path, vec!["sub", "b.txt"]);
    }

    #[test]
    fn test_parse_announce_list() {
        let root = Value::dict(vec![
            ("announce", Value::from("http://a/announce")),
            (
                "announce-list",
                Value::List(vec![
                    Value::list(vec!["http://a/announce"]),
                    Value::list(vec!["udp://b:80", "udp://c:80"]),
                ]),
            ),
            ("info", info_dict(10, 16, 1)),
        ]);
        let torrent = TorrentParser::parse_value(&root).unwrap();
        assert_eq!(torrent.announce_list.len(), 2);
        assert_eq!(torrent.trackers()[2], (1, "udp://c:80".to_string()));
    }

    #[test]
    fn test_reject_bad_metadata() {
        // pieces not a multiple of 20
        let mut info = info_dict(10, 16, 1);
        if let Value::Dict(map) = &mut info {
            map.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 21]));
        }
        assert!(TorrentParser::parse_bytes(&torrent_bytes(info)).is_err());

        // piece count does not cover the content
        assert!(TorrentParser::parse_bytes(&torrent_bytes(info_dict(100, 16, 1))).is_err());

        // not a dictionary
        assert!(TorrentParser::parse_bytes(b"i1e").is_err());

        // unsafe path component
        let info = Value::dict(vec![
            ("name", Value::from("dir")),
            ("piece length", Value::Integer(16)),
            ("pieces", Value::Bytes(vec![0u8; 20])),
            (
                "files",
                Value::List(vec![Value::dict(vec![
                    ("length", Value::Integer(10)),
                    ("path", Value::list(vec![".."])),
                ])]),
            ),
        ]);
        assert!(TorrentParser::parse_bytes(&torrent_bytes(info)).is_err());

        // unsafe names, single and multi-file
        for name in ["../escaped.bin", "/tmp/escaped.bin", "..", ".", "", "a\\b"] {
            let mut info = info_dict(10, 16, 1);
            if let Value::Dict(map) = &mut info {
                map.insert(b"name".to_vec(), Value::from(name));
            }
            let err = TorrentParser::parse_bytes(&torrent_bytes(info)).unwrap_err();
            assert!(err.to_string().contains("Unsafe"), "{:?} accepted: {}", name, err);
        }
        let info = Value::dict(vec![
            ("name", Value::from("..")),
            ("piece length", Value::Integer(16)),
            ("pieces", Value::Bytes(vec![0u8; 20])),
            (
                "files",
                Value::List(vec![Value::dict(vec![
                    ("length", Value::Integer(10)),
                    ("path", Value::list(vec!["a.txt"])),
                ])]),
            ),
        ]);
        assert!(TorrentParser::parse_bytes(&torrent_bytes(info)).is_err());
    }
}
