use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::ApplicationError;

/// Represents a parsed single-file .torrent
#[derive(Debug, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info: Info,
    #[serde(skip)]
    info_hash: [u8; 20],
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: Option<i64>,
    pub files: Option<Vec<TorrentFile>>,
}

/// A file entry of a multi-file torrent. Only parsed so such torrents can be
/// rejected with a clear message.
#[derive(Debug, Deserialize)]
pub struct TorrentFile {
    pub length: i64,
    pub path: Vec<String>,
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`] struct
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ApplicationError> {
        let data = std::fs::read(path.as_ref()).map_err(|e| {
            ApplicationError::ParserError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_bytes(&data)
    }

    /// Parses bencoded metainfo.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        // Re-encode the info dictionary on its own to hash it
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data)
                .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| ApplicationError::ParserError("missing info".into()))?;

        let info_raw_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let torrent: Torrent = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let torrent = Torrent {
            info_hash: Sha1::digest(&info_raw_bytes).into(),
            ..torrent
        };
        torrent.validate()?;
        Ok(torrent)
    }

    fn validate(&self) -> Result<(), ApplicationError> {
        if let Some(files) = &self.info.files {
            return Err(ApplicationError::ParserError(format!(
                "multi-file torrents are not supported ({} files)",
                files.len()
            )));
        }
        match self.info.length {
            Some(len) if len >= 0 => {}
            Some(len) => {
                return Err(ApplicationError::ParserError(format!(
                    "negative length {}",
                    len
                )));
            }
            None => return Err(ApplicationError::ParserError("missing length".into())),
        }
        if self.info.piece_length <= 0 {
            return Err(ApplicationError::ParserError(format!(
                "invalid piece length {}",
                self.info.piece_length
            )));
        }
        if self.info.pieces.len() % 20 != 0 {
            return Err(ApplicationError::ParserError(
                "pieces length not divisible by 20".into(),
            ));
        }
        let expected = self.total_length().div_ceil(self.piece_length()) as usize;
        if self.pieces_count() != expected {
            return Err(ApplicationError::ParserError(format!(
                "expected {} piece hashes, found {}",
                expected,
                self.pieces_count()
            )));
        }
        let name = &self.info.name;
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(ApplicationError::ParserError(format!(
                "unsafe output name {:?}",
                name
            )));
        }
        Ok(())
    }

    pub fn announce_url(&self) -> &str {
        &self.announce
    }

    /// SHA-1 of the bencoded `info` dictionary
    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Name of the single file the torrent describes
    pub fn output_name(&self) -> &str {
        &self.info.name
    }

    pub fn total_length(&self) -> u64 {
        self.info.length.unwrap_or(0) as u64
    }

    /// Returns the number of pieces the torrent is divided into
    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the declared length of each piece (in bytes)
    ///
    /// The last piece may be shorter.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length as u64
    }

    /// Returns the SHA1 hash of each piece, in piece order
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect()
    }

    pub fn log_info(&self) {
        info!(
            name = %self.info.name,
            announce = %self.announce,
            info_hash = %self.info_hash_hex(),
            piece_length = self.piece_length(),
            pieces = self.pieces_count(),
            total_size = self.total_length(),
            "torrent loaded"
        );
    }
}
