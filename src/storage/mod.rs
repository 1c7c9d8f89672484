//! Storage module
//!
//! Block-addressed, hash-verified storage of torrent content on disk.

pub mod file;
pub mod piece;
pub mod store;

// Re-export file provisioning types
pub use file::{file_layout, open_files, BlockFile, DiskProvider, FileEntry, FileProvider};

// Re-export piece types
pub use piece::{BlockLayout, PieceStatus};

// Re-export store
pub use store::PieceStore;
