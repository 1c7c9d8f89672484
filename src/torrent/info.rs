//! Torrent metadata
//!
//! Immutable description of a swarm's content, loaded from a metainfo file.

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;

/// A file entry in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components below the torrent's directory (e.g. ["sub", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Decoded torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// Tracker tiers from `announce-list`, tier order preserved
    pub announce_list: Vec<Vec<String>>,
    /// SHA1 over the canonical bencoding of the info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// Piece hashes (each a 20-byte SHA1)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name (file name, or directory name for multi-file torrents)
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Total size of all files in the torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Iterate over the content files in metadata order
    ///
    /// A single-file torrent yields one entry named after the torrent.
    pub fn files_iter(&self) -> impl Iterator<Item = TorrentFile> + '_ {
        let single = match (&self.files, self.length) {
            (None, Some(length)) => Some(TorrentFile {
                path: vec![self.name.clone()],
                length,
            }),
            _ => None,
        };

        self.files
            .iter()
            .flat_map(|files| files.iter().cloned())
            .chain(single)
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Every announce URL with its tier index
    ///
    /// Tiers come from `announce-list` when present; otherwise `announce`
    /// forms tier 0 on its own. Duplicates keep their first occurrence.
    pub fn trackers(&self) -> Vec<(usize, String)> {
        let mut out: Vec<(usize, String)> = Vec::new();
        if self.announce_list.is_empty() {
            if !self.announce.is_empty() {
                out.push((0, self.announce.clone()));
            }
            return out;
        }

        for (tier, urls) in self.announce_list.iter().enumerate() {
            for url in urls {
                if !out.iter().any(|(_, u)| u == url) {
                    out.push((tier, url.clone()));
                }
            }
        }
        out
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// SHA1 of the encoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file(length: u64, pieces: usize) -> TorrentInfo {
        TorrentInfo {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: vec![],
            info_hash: [1u8; 20],
            piece_length: 1024,
            pieces: vec![[2u8; 20]; pieces],
            name: "single.txt".to_string(),
            length: Some(length),
            files: None,
        }
    }

    #[test]
    fn test_torrent_info_single_file() {
        let info = single_file(2048, 2);
        assert_eq!(info.total_size(), 2048);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_torrent_info_multi_file() {
        let mut info = single_file(0, 1);
        info.length = None;
        info.files = Some(vec![
            TorrentFile { path: vec!["file1.txt".to_string()], length: 500 },
            TorrentFile { path: vec!["sub".to_string(), "file2.txt".to_string()], length: 524 },
        ]);

        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
        let files: Vec<_> = info.files_iter().collect();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].path, vec!["sub", "file2.txt"]);
    }

    #[test]
    fn test_files_iter_single_file() {
        let info = single_file(2048, 2);
        let files: Vec<_> = info.files_iter().collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, vec!["single.txt"]);
        assert_eq!(files[0].length, 2048);
    }

    #[test]
    fn test_trackers_without_list() {
        let info = single_file(10, 1);
        assert_eq!(info.trackers(), vec![(0, "http://tracker.example.com/announce".to_string())]);
    }

    #[test]
    fn test_trackers_keep_tiers() {
        let mut info = single_file(10, 1);
        info.announce_list = vec![
            vec!["udp://a:80".to_string(), "http://b/announce".to_string()],
            vec!["udp://c:80".to_string(), "udp://a:80".to_string()],
        ];

        let trackers = info.trackers();
        assert_eq!(
            trackers,
            vec![
                (0, "udp://a:80".to_string()),
                (0, "http://b/announce".to_string()),
                (1, "udp://c:80".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);

        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }
}
