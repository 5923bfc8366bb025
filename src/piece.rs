use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identifies a live peer connection. The pool never runs two connections to
/// the same address at once, so the address is unique for as long as the
/// connection lives.
pub type PeerHandle = SocketAddr;

/// Represents the current state of a block within a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    /// The block has not been requested from any peer yet
    NotRequested,
    /// The block has been requested from `peer` and not yet received
    Requested { peer: PeerHandle, at: Instant },
    /// The block has been successfully downloaded
    Received(Vec<u8>),
}

/// A contiguous block of data within a piece
#[derive(Debug, Clone)]
pub struct Block {
    /// Offset (in bytes) from the start of the piece
    pub offset: usize,
    /// Length of the block in bytes
    pub length: usize,
    /// Current state of the block
    pub state: BlockState,
}

impl Block {
    pub fn is_requested_by(&self, peer: &PeerHandle) -> bool {
        matches!(&self.state, BlockState::Requested { peer: p, .. } if p == peer)
    }

    pub fn is_received(&self) -> bool {
        matches!(self.state, BlockState::Received(_))
    }
}

/// Download status of a whole piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// No block requested or received
    Missing,
    /// At least one block requested or received
    Pending,
    /// Hash verified
    Done,
}

/// Outcome of feeding the last block of a piece through verification.
#[derive(Debug, PartialEq, Eq)]
pub enum Verification {
    /// Hash matched, the assembled bytes are ready for the disk writer
    Valid(Vec<u8>),
    /// Hash mismatch, every block has been reset
    Corrupt,
}

/// A piece of the torrent file, composed of one or more blocks
#[derive(Debug, Clone)]
pub struct Piece {
    /// Index of the piece (0-based)
    pub index: usize,
    /// Length of the piece in bytes
    pub length: usize,
    /// Expected SHA-1 of the piece contents
    pub hash: [u8; 20],
    /// Current status, kept in sync with the block table
    pub status: PieceStatus,
    /// List of blocks that make up this piece, in offset order
    pub blocks: Vec<Block>,
}

impl Piece {
    /// Splits a piece of `length` bytes into blocks of at most `block_size`.
    pub fn new(index: usize, length: usize, hash: [u8; 20], block_size: usize) -> Self {
        let blocks = (0..length)
            .step_by(block_size)
            .map(|off| Block {
                offset: off,
                length: std::cmp::min(block_size, length - off),
                state: BlockState::NotRequested,
            })
            .collect();

        Self {
            index,
            length,
            hash,
            status: PieceStatus::Missing,
            blocks,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == PieceStatus::Done
    }

    pub fn block(&self, offset: usize) -> Option<&Block> {
        self.blocks.iter().find(|b| b.offset == offset)
    }

    fn block_mut(&mut self, offset: usize) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.offset == offset)
    }

    /// Lowest-offset block nobody has claimed yet.
    pub fn next_unrequested(&self) -> Option<&Block> {
        if self.is_done() {
            return None;
        }
        self.blocks
            .iter()
            .find(|b| matches!(b.state, BlockState::NotRequested))
    }

    /// Claims the block at `offset` for `peer`. Fails if it is not free.
    pub fn claim(&mut self, offset: usize, peer: PeerHandle, now: Instant) -> bool {
        let claimed = match self.block_mut(offset) {
            Some(block) if block.state == BlockState::NotRequested => {
                block.state = BlockState::Requested { peer, at: now };
                true
            }
            _ => false,
        };
        self.refresh_status();
        claimed
    }

    /// Stores `data` for a block `peer` had claimed.
    ///
    /// Returns false (and changes nothing) for blocks that are not currently
    /// claimed by `peer` or whose length does not match.
    pub fn receive(&mut self, offset: usize, peer: &PeerHandle, data: Vec<u8>) -> bool {
        let accepted = match self.block_mut(offset) {
            Some(block) if block.is_requested_by(peer) && block.length == data.len() => {
                block.state = BlockState::Received(data);
                true
            }
            _ => false,
        };
        self.refresh_status();
        accepted
    }

    /// Gives back one claim held by `peer`.
    pub fn release(&mut self, offset: usize, peer: &PeerHandle) -> bool {
        let released = match self.block_mut(offset) {
            Some(block) if block.is_requested_by(peer) => {
                block.state = BlockState::NotRequested;
                true
            }
            _ => false,
        };
        self.refresh_status();
        released
    }

    /// Resets claims older than `timeout`, returning `(peer, offset)` pairs.
    pub fn release_stale(&mut self, now: Instant, timeout: Duration) -> Vec<(PeerHandle, usize)> {
        let mut freed = Vec::new();
        for block in self.blocks.iter_mut() {
            if let BlockState::Requested { peer, at } = block.state {
                if now.saturating_duration_since(at) >= timeout {
                    block.state = BlockState::NotRequested;
                    freed.push((peer, block.offset));
                }
            }
        }
        self.refresh_status();
        freed
    }

    pub fn is_fully_received(&self) -> bool {
        self.blocks.iter().all(Block::is_received)
    }

    /// Hashes the assembled piece once every block is in.
    ///
    /// Must only be called when [`Piece::is_fully_received`] holds. A match
    /// moves the piece to `Done`, a mismatch resets every block.
    pub fn verify(&mut self) -> Verification {
        let mut data = Vec::with_capacity(self.length);
        for block in &self.blocks {
            if let BlockState::Received(bytes) = &block.state {
                data.extend_from_slice(bytes);
            }
        }

        let digest: [u8; 20] = Sha1::digest(&data).into();
        if digest == self.hash && data.len() == self.length {
            // drop the per-block copies, the assembled buffer is handed out
            for block in self.blocks.iter_mut() {
                block.state = BlockState::Received(Vec::new());
            }
            self.status = PieceStatus::Done;
            Verification::Valid(data)
        } else {
            self.reset();
            Verification::Corrupt
        }
    }

    /// Forgets everything about this piece so it is downloaded again.
    pub fn reset(&mut self) {
        for block in self.blocks.iter_mut() {
            block.state = BlockState::NotRequested;
        }
        self.status = PieceStatus::Missing;
    }

    fn refresh_status(&mut self) {
        if self.is_done() {
            return;
        }
        let touched = self
            .blocks
            .iter()
            .any(|b| !matches!(b.state, BlockState::NotRequested));
        self.status = if touched {
            PieceStatus::Pending
        } else {
            PieceStatus::Missing
        };
    }
}
