//! File provisioning
//!
//! Resolves a torrent's file layout and opens the backing handles the piece
//! store reads and writes through.

use std::fs::OpenOptions;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, error, info};

use crate::error::TorrentError;
use crate::torrent::TorrentInfo;

/// A seekable, writable handle backing part of the logical address space
pub trait BlockFile: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> BlockFile for T {}

/// Source of directories and sized file handles
pub trait FileProvider: Send + Sync {
    /// Create a directory and its parents if missing
    fn ensure_directory(&self, path: &Path) -> Result<()>;

    /// Open the file at `path`, creating it if needed, sized to exactly `size` bytes
    fn open_or_create(&self, path: &Path, size: u64) -> Result<Box<dyn BlockFile>>;
}

/// Provider backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskProvider;

impl FileProvider for DiskProvider {
    fn ensure_directory(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }
        debug!("Creating directory: {}", path.display());
        std::fs::create_dir_all(path).map_err(|e| {
            error!("Failed to create directory '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to create directory", path.display().to_string(), e.to_string()).into()
        })
    }

    fn open_or_create(&self, path: &Path, size: u64) -> Result<Box<dyn BlockFile>> {
        debug!("Opening file: {} ({} bytes)", path.display(), size);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                error!("Failed to open file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to open file", path.display().to_string(), e.to_string())
            })?;

        file.set_len(size).map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        Ok(Box::new(file))
    }
}

/// A file's position in the logical address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Logical offset of the file's first byte
    pub offset: u64,
    pub length: u64,
}

/// Resolve the on-disk layout of a torrent below `base_dir`
///
/// Single-file torrents map to `base_dir/name`; multi-file torrents to
/// `base_dir/name/<path components>`. Metadata order is preserved.
pub fn file_layout(torrent: &TorrentInfo, base_dir: &Path) -> Vec<FileEntry> {
    let root = if torrent.is_multi_file() {
        base_dir.join(&torrent.name)
    } else {
        base_dir.to_path_buf()
    };

    let mut offset = 0u64;
    torrent
        .files_iter()
        .map(|file| {
            let path = file.path.iter().fold(root.clone(), |acc, part| acc.join(part));
            let entry = FileEntry { path, offset, length: file.length };
            offset += file.length;
            entry
        })
        .collect()
}

/// Provision every file of the layout, creating parent directories first
pub fn open_files(
    entries: &[FileEntry],
    provider: &dyn FileProvider,
) -> Result<Vec<(PathBuf, Box<dyn BlockFile>, u64)>> {
    info!("Provisioning {} files", entries.len());
    let mut handles = Vec::with_capacity(entries.len());
    for entry in entries {
        if let Some(parent) = entry.path.parent() {
            provider.ensure_directory(parent)?;
        }
        let handle = provider.open_or_create(&entry.path, entry.length)?;
        handles.push((entry.path.clone(), handle, entry.length));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn torrent(files: Option<Vec<TorrentFile>>, length: Option<u64>) -> TorrentInfo {
        TorrentInfo {
            announce: String::new(),
            announce_list: vec![],
            info_hash: [0u8; 20],
            piece_length: 16,
            pieces: vec![],
            name: "content".to_string(),
            length,
            files,
        }
    }

    #[test]
    fn test_single_file_layout() {
        let layout = file_layout(&torrent(None, Some(100)), Path::new("/data"));
        assert_eq!(
            layout,
            vec![FileEntry { path: PathBuf::from("/data/content"), offset: 0, length: 100 }]
        );
    }

    #[test]
    fn test_multi_file_layout_offsets() {
        let files = vec![
            TorrentFile { path: vec!["a.txt".to_string()], length: 10 },
            TorrentFile { path: vec!["sub".to_string(), "b.txt".to_string()], length: 20 },
            TorrentFile { path: vec!["c.txt".to_string()], length: 5 },
        ];
        let layout = file_layout(&torrent(Some(files), None), Path::new("/data"));
        assert_eq!(layout[0].path, PathBuf::from("/data/content/a.txt"));
        assert_eq!(layout[1].path, PathBuf::from("/data/content/sub/b.txt"));
        assert_eq!(layout[1].offset, 10);
        assert_eq!(layout[2].offset, 30);
    }

    #[test]
    fn test_disk_provider_sizes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.bin");
        let entries = vec![FileEntry { path: path.clone(), offset: 0, length: 1234 }];

        let handles = open_files(&entries, &DiskProvider).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1234);
    }
}
