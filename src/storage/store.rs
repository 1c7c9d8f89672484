//! Piece store
//!
//! Block-addressed, hash-verified view over the files of a torrent. The files
//! are laid end to end to form one logical byte stream; reads and writes are
//! confined to a single block and may span file boundaries.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::storage::file::{file_layout, open_files, BlockFile, FileProvider};
use crate::storage::piece::{BlockLayout, PieceStatus};
use crate::torrent::TorrentInfo;

/// One backing file and its place in the address space
struct Slot {
    name: String,
    handle: Box<dyn BlockFile>,
    start: u64,
    length: u64,
}

/// State guarded by the store's lock
struct Inner {
    files: Vec<Slot>,
    states: Vec<PieceStatus>,
}

/// Hash-verified block storage shared by all connections of a swarm
pub struct PieceStore {
    layout: BlockLayout,
    hashes: Vec<[u8; 20]>,
    inner: Mutex<Inner>,
}

impl PieceStore {
    /// Build a store over already opened handles, in address-space order
    ///
    /// Each entry is `(display name, handle, length)`.
    pub fn new(
        files: Vec<(String, Box<dyn BlockFile>, u64)>,
        block_size: u64,
        hashes: Vec<[u8; 20]>,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(files.len());
        let mut start = 0u64;
        for (name, handle, length) in files {
            slots.push(Slot { name, handle, start, length });
            start += length;
        }

        let layout = BlockLayout::new(start, block_size)?;
        if hashes.len() != layout.num_blocks {
            error!(
                "Hash count {} does not match block count {}",
                hashes.len(),
                layout.num_blocks
            );
            return Err(TorrentError::validation_error_with_field(
                format!("Expected {} block hashes, got {}", layout.num_blocks, hashes.len()),
                "hashes",
            )
            .into());
        }

        debug!(
            "Piece store: {} bytes, {} blocks of {} bytes, {} files",
            layout.size,
            layout.num_blocks,
            block_size,
            slots.len()
        );

        Ok(Self {
            layout,
            hashes,
            inner: Mutex::new(Inner {
                files: slots,
                states: vec![PieceStatus::Unknown; layout.num_blocks],
            }),
        })
    }

    /// Build a store for a torrent, provisioning its files below `base_dir`
    pub fn from_torrent(torrent: &TorrentInfo, base_dir: &Path, provider: &dyn FileProvider) -> Result<Self> {
        info!("Opening piece store for '{}' in {}", torrent.name, base_dir.display());
        provider.ensure_directory(base_dir)?;

        let entries = file_layout(torrent, base_dir);
        let files = open_files(&entries, provider)?
            .into_iter()
            .map(|(path, handle, length): (PathBuf, _, _)| (path.display().to_string(), handle, length))
            .collect();

        Self::new(files, torrent.piece_length, torrent.pieces.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.num_blocks
    }

    pub fn block_size(&self) -> u64 {
        self.layout.block_size
    }

    /// Total bytes in the logical address space
    pub fn size(&self) -> u64 {
        self.layout.size
    }

    /// True size of block `index`
    pub fn block_len(&self, index: usize) -> Option<u64> {
        self.layout.block_len(index)
    }

    /// Read `length` bytes at `offset` within block `index`
    pub fn read(&self, index: usize, offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = self.layout.check_range(index, offset, length)?;
        trace!("Reading block {} offset {} ({} bytes)", index, offset, length);

        let mut buf = vec![0u8; length as usize];
        let mut inner = self.lock();
        read_span(&mut inner.files, start, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset` within block `index`
    ///
    /// The block's cached verification result is discarded under the same
    /// lock, so no verifier can observe a stale `Valid`.
    pub fn write(&self, index: usize, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.layout.check_range(index, offset, data.len() as u64)?;
        trace!("Writing block {} offset {} ({} bytes)", index, offset, data.len());

        let mut inner = self.lock();
        inner.states[index] = PieceStatus::Unknown;
        write_span(&mut inner.files, start, data)?;
        Ok(())
    }

    /// Check block `index` against its hash
    ///
    /// A cached result is returned unless `force` is set or a write has
    /// invalidated it.
    pub fn verify_block(&self, index: usize, force: bool) -> Result<bool> {
        let block_len = self.layout.block_len(index).ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("Block index {} out of range", index), "block_index")
        })?;

        let mut inner = self.lock();
        if !force {
            match inner.states[index] {
                PieceStatus::Valid => return Ok(true),
                PieceStatus::Invalid => return Ok(false),
                PieceStatus::Unknown => {}
            }
        }

        let mut buf = vec![0u8; block_len as usize];
        read_span(&mut inner.files, self.layout.block_offset(index), &mut buf)?;
        let digest: [u8; 20] = Sha1::digest(&buf).into();
        let valid = digest == self.hashes[index];

        inner.states[index] = if valid { PieceStatus::Valid } else { PieceStatus::Invalid };
        if valid {
            debug!("Block {} verification: PASSED", index);
        } else {
            trace!(
                "Block {} verification: FAILED (expected {}, got {})",
                index,
                hex::encode(self.hashes[index]),
                hex::encode(digest)
            );
        }
        Ok(valid)
    }

    /// Verify every block, warming the cache; true when all are valid
    pub fn verify_all(&self) -> Result<bool> {
        let mut all = true;
        for index in 0..self.layout.num_blocks {
            all &= self.verify_block(index, false)?;
        }
        info!(
            "Verified {} blocks: {} missing",
            self.layout.num_blocks,
            self.missing_count()
        );
        Ok(all)
    }

    /// Per-block verification snapshot
    pub fn bitfield(&self) -> Result<Bitfield> {
        let mut bits = Vec::with_capacity(self.layout.num_blocks);
        for index in 0..self.layout.num_blocks {
            bits.push(self.verify_block(index, false)?);
        }
        Ok(Bitfield::from(bits))
    }

    /// Cached status of block `index`
    pub fn status(&self, index: usize) -> PieceStatus {
        self.lock().states.get(index).copied().unwrap_or_default()
    }

    /// Whether block `index` is known to be valid (cached; does not hash)
    pub fn has_block(&self, index: usize) -> bool {
        self.status(index) == PieceStatus::Valid
    }

    /// Number of blocks not known to be valid
    pub fn missing_count(&self) -> usize {
        self.lock().states.iter().filter(|s| **s != PieceStatus::Valid).count()
    }

    /// Fraction of blocks still missing, in [0, 1]
    pub fn missing_fraction(&self) -> f64 {
        if self.layout.num_blocks == 0 {
            return 0.0;
        }
        self.missing_count() as f64 / self.layout.num_blocks as f64
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0
    }

    /// Bytes still to download, as reported to trackers
    pub fn left(&self) -> u64 {
        let inner = self.lock();
        inner
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s != PieceStatus::Valid)
            .filter_map(|(i, _)| self.layout.block_len(i))
            .sum()
    }

    /// One character per block: `*` valid, `o` has data but not valid, `.` empty
    pub fn piece_chart(&self) -> Result<String> {
        let mut chart = String::with_capacity(self.layout.num_blocks);
        for index in 0..self.layout.num_blocks {
            if self.verify_block(index, false)? {
                chart.push('*');
                continue;
            }
            let len = self.layout.block_len(index).unwrap_or(0);
            let data = self.read(index, 0, len)?;
            chart.push(if data.iter().any(|&b| b != 0) { 'o' } else { '.' });
        }
        Ok(chart)
    }
}

impl fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PieceStore")
            .field("layout", &self.layout)
            .field("missing", &self.missing_count())
            .finish()
    }
}

impl fmt::Display for PieceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.piece_chart() {
            Ok(chart) => write!(f, "[{}]", chart),
            Err(e) => {
                warn!("Failed to render piece chart: {}", e);
                write!(f, "[{} blocks]", self.layout.num_blocks)
            }
        }
    }
}

fn io_error(action: &str, slot: &Slot, e: std::io::Error) -> anyhow::Error {
    error!("Failed to {} '{}': {}", action, slot.name, e);
    TorrentError::storage_error_full(format!("Failed to {}", action), slot.name.clone(), e.to_string()).into()
}

/// Run `op` over each file segment overlapping `[start, start + len)`
fn for_each_segment<F>(files: &mut [Slot], start: u64, len: usize, mut op: F) -> Result<()>
where
    F: FnMut(&mut Slot, u64, std::ops::Range<usize>) -> Result<()>,
{
    let mut done = 0usize;
    for slot in files.iter_mut() {
        if done == len {
            break;
        }
        let pos = start + done as u64;
        let end = slot.start + slot.length;
        if end <= pos || slot.start > pos {
            continue;
        }
        let n = std::cmp::min((len - done) as u64, end - pos) as usize;
        op(slot, pos - slot.start, done..done + n)?;
        done += n;
    }

    if done != len {
        return Err(TorrentError::storage_error(format!(
            "Range {}+{} not covered by backing files",
            start, len
        ))
        .into());
    }
    Ok(())
}

fn read_span(files: &mut [Slot], start: u64, buf: &mut [u8]) -> Result<()> {
    let len = buf.len();
    for_each_segment(files, start, len, |slot, file_offset, range| {
        slot.handle
            .seek(SeekFrom::Start(file_offset))
            .map_err(|e| io_error("seek in file", slot, e))?;
        slot.handle
            .read_exact(&mut buf[range])
            .map_err(|e| io_error("read from file", slot, e))
    })
}

fn write_span(files: &mut [Slot], start: u64, data: &[u8]) -> Result<()> {
    for_each_segment(files, start, data.len(), |slot, file_offset, range| {
        slot.handle
            .seek(SeekFrom::Start(file_offset))
            .map_err(|e| io_error("seek in file", slot, e))?;
        slot.handle
            .write_all(&data[range])
            .map_err(|e| io_error("write to file", slot, e))?;
        slot.handle.flush().map_err(|e| io_error("flush file", slot, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::DiskProvider;
    use crate::torrent::TorrentFile;
    use std::io::Cursor;

    fn sha1(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn memory_files(lengths: &[u64]) -> Vec<(String, Box<dyn BlockFile>, u64)> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let handle: Box<dyn BlockFile> = Box::new(Cursor::new(vec![0u8; len as usize]));
                (format!("file{}", i), handle, len)
            })
            .collect()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    fn hashes_for(data: &[u8], block_size: usize) -> Vec<[u8; 20]> {
        data.chunks(block_size).map(sha1).collect()
    }

    #[test]
    fn test_write_then_verify() {
        let data = content(100);
        let store = PieceStore::new(memory_files(&[100]), 40, hashes_for(&data, 40)).unwrap();
        assert_eq!(store.num_blocks(), 3);
        assert_eq!(store.block_len(2), Some(20));

        assert!(!store.verify_block(0, false).unwrap());
        store.write(0, 0, &data[..40]).unwrap();
        assert!(store.verify_block(0, false).unwrap());
        assert!(!store.verify_block(1, false).unwrap());
    }

    #[test]
    fn test_write_invalidates_cached_result() {
        let data = content(80);
        let store = PieceStore::new(memory_files(&[80]), 40, hashes_for(&data, 40)).unwrap();

        store.write(1, 0, &data[40..]).unwrap();
        assert!(store.verify_block(1, false).unwrap());
        assert_eq!(store.status(1), PieceStatus::Valid);

        store.write(1, 5, &[0xff]).unwrap();
        assert_eq!(store.status(1), PieceStatus::Unknown);
        assert!(!store.verify_block(1, false).unwrap());
        assert_eq!(store.status(1), PieceStatus::Invalid);
    }

    #[test]
    fn test_cached_result_without_force() {
        let data = content(40);
        let mut files = memory_files(&[40]);
        files[0].1 = Box::new(Cursor::new(data.clone())) as Box<dyn BlockFile>;
        let store = PieceStore::new(files, 40, hashes_for(&data, 40)).unwrap();

        assert!(store.verify_all().unwrap());
        assert!(store.is_complete());
        assert!(store.verify_block(0, true).unwrap());
    }

    #[test]
    fn test_bounds_rejected() {
        let data = content(100);
        let store = PieceStore::new(memory_files(&[100]), 40, hashes_for(&data, 40)).unwrap();

        assert!(store.read(3, 0, 1).is_err());
        assert!(store.read(0, 40, 1).is_err());
        assert!(store.read(0, 10, 31).is_err());
        assert!(store.read(2, 0, 21).is_err());
        assert!(store.write(0, 1, &[0u8; 40]).is_err());
        assert!(store.write(2, 10, &[0u8; 11]).is_err());
        assert!(store.verify_block(3, false).is_err());

        assert_eq!(store.read(2, 0, 20).unwrap().len(), 20);
    }

    #[test]
    fn test_spans_file_boundaries() {
        let data = content(50);
        // files of 7, 30, 13 bytes; block 1 covers bytes 25..50 across two files
        let store = PieceStore::new(memory_files(&[7, 30, 13]), 25, hashes_for(&data, 25)).unwrap();

        store.write(0, 0, &data[..25]).unwrap();
        store.write(1, 0, &data[25..]).unwrap();
        assert!(store.verify_all().unwrap());
        assert_eq!(store.read(0, 5, 10).unwrap(), data[5..15].to_vec());
        assert_eq!(store.read(1, 10, 15).unwrap(), data[35..50].to_vec());
    }

    #[test]
    fn test_hash_count_must_match() {
        assert!(PieceStore::new(memory_files(&[100]), 40, vec![[0u8; 20]; 2]).is_err());
    }

    #[test]
    fn test_progress_accounting() {
        let data = content(100);
        let store = PieceStore::new(memory_files(&[100]), 40, hashes_for(&data, 40)).unwrap();
        assert_eq!(store.left(), 100);
        assert_eq!(store.missing_count(), 3);

        store.write(2, 0, &data[80..]).unwrap();
        store.verify_all().unwrap();
        assert_eq!(store.left(), 80);
        assert!((store.missing_fraction() - 2.0 / 3.0).abs() < 1e-9);
        assert!(store.has_block(2));
        assert!(!store.has_block(0));

        let bitfield = store.bitfield().unwrap();
        assert!(bitfield.get(2));
        assert!(!bitfield.get(0));
    }

    #[test]
    fn test_piece_chart() {
        let data = content(120);
        let store = PieceStore::new(memory_files(&[120]), 40, hashes_for(&data, 40)).unwrap();
        store.write(0, 0, &data[..40]).unwrap();
        store.write(1, 3, &[9, 9]).unwrap();

        assert_eq!(store.piece_chart().unwrap(), "*o.");
        assert_eq!(store.to_string(), "[*o.]");
    }

    #[test]
    fn test_from_torrent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let data = content(48);
        let torrent = TorrentInfo {
            announce: "udp://tracker:80".to_string(),
            announce_list: vec![],
            info_hash: [0u8; 20],
            piece_length: 16,
            pieces: hashes_for(&data, 16),
            name: "set".to_string(),
            length: None,
            files: Some(vec![
                TorrentFile { path: vec!["one.bin".to_string()], length: 20 },
                TorrentFile { path: vec!["deep".to_string(), "two.bin".to_string()], length: 28 },
            ]),
        };

        let store = PieceStore::from_torrent(&torrent, dir.path(), &DiskProvider).unwrap();
        for i in 0..3 {
            store.write(i, 0, &data[i * 16..(i + 1) * 16]).unwrap();
        }
        assert!(store.verify_all().unwrap());
        drop(store);

        let two = std::fs::read(dir.path().join("set").join("deep").join("two.bin")).unwrap();
        assert_eq!(two, data[20..].to_vec());

        // reopening keeps the data
        let reopened = PieceStore::from_torrent(&torrent, dir.path(), &DiskProvider).unwrap();
        assert!(reopened.verify_all().unwrap());
    }
}
