//! A download-only BitTorrent client for single-file torrents.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use client::TorrentClient;
pub use config::ClientConfig;
pub use error::ApplicationError;
pub use manager::PieceManager;
pub use storage::{FileWriter, PieceWriter};
pub use torrent::Torrent;
pub use tracker::{Announcer, Tracker};
