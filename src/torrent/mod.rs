//! Torrent metadata module
//!
//! Parsing of .torrent files into [`TorrentInfo`].

pub mod info;
pub mod parser;

pub use info::{TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
