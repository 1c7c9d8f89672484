//! Block layout and verification status
//!
//! Geometry of the logical address space shared by all files of a torrent.

use anyhow::Result;

use crate::error::TorrentError;

/// Verification status of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    /// Not checked since startup or the last write
    #[default]
    Unknown,
    /// Hash matched
    Valid,
    /// Hash did not match
    Invalid,
}

/// Partition of `size` bytes into fixed-size blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Total bytes across all files
    pub size: u64,
    /// Nominal block size
    pub block_size: u64,
    /// `ceil(size / block_size)`
    pub num_blocks: usize,
}

impl BlockLayout {
    pub fn new(size: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(TorrentError::validation_error_with_field("Block size must be positive", "block_size").into());
        }
        let num_blocks = usize::try_from(size.div_ceil(block_size))
            .map_err(|_| TorrentError::validation_error_with_field("Too many blocks", "size"))?;
        Ok(Self { size, block_size, num_blocks })
    }

    /// Size of the final block
    pub fn last_block_size(&self) -> u64 {
        if self.num_blocks == 0 {
            return 0;
        }
        self.size - self.block_size * (self.num_blocks as u64 - 1)
    }

    /// True size of block `index`, or None when out of range
    pub fn block_len(&self, index: usize) -> Option<u64> {
        if index >= self.num_blocks {
            None
        } else if index + 1 == self.num_blocks {
            Some(self.last_block_size())
        } else {
            Some(self.block_size)
        }
    }

    /// Logical offset where block `index` begins
    pub fn block_offset(&self, index: usize) -> u64 {
        index as u64 * self.block_size
    }

    /// Validate an access of `length` bytes at `offset` within block `index`
    ///
    /// Returns the logical offset of the first byte.
    pub fn check_range(&self, index: usize, offset: u64, length: u64) -> Result<u64> {
        let block_len = self.block_len(index).ok_or_else(|| {
            TorrentError::validation_error_with_field(
                format!("Block index {} out of range ({} blocks)", index, self.num_blocks),
                "block_index",
            )
        })?;

        if offset >= self.block_size {
            return Err(TorrentError::validation_error_with_field(
                format!("Offset {} not below block size {}", offset, self.block_size),
                "offset",
            )
            .into());
        }

        match offset.checked_add(length) {
            Some(end) if end <= block_len => Ok(self.block_offset(index) + offset),
            _ => Err(TorrentError::validation_error_with_field(
                format!("Range {}+{} exceeds block {} of {} bytes", offset, length, index, block_len),
                "length",
            )
            .into()),
        }
    }
}
