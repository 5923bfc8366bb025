//! Shared piece and block bookkeeping.
//!
//! [`PieceManager`] is the only place block state changes. Peer connections
//! ask it for work and hand it data; every call runs under one lock, so two
//! connections can never hold the same block or write the same piece twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::error::ApplicationError;
use crate::piece::{PeerHandle, Piece, PieceStatus, Verification};
use crate::protocol::Message;
use crate::storage::PieceWriter;
use crate::torrent::Torrent;

/// One block a peer connection should ask its remote for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: usize,
    pub begin: usize,
    pub length: usize,
}

impl BlockRequest {
    pub fn request_message(&self) -> Message {
        Message::Request {
            index: self.index as u32,
            begin: self.begin as u32,
            length: self.length as u32,
        }
    }

    pub fn cancel_message(&self) -> Message {
        Message::Cancel {
            index: self.index as u32,
            begin: self.begin as u32,
            length: self.length as u32,
        }
    }
}

/// What happened to a block handed to [`PieceManager::block_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Not claimed by this peer, wrong length, or already have it
    Ignored,
    /// Stored, piece still incomplete
    Stored,
    /// Last block of a piece that verified and was written
    PieceDone(usize),
    /// Last block of a piece whose hash did not match; piece reset
    PieceCorrupt(usize),
    /// Piece verified but the disk writer failed; piece reset
    WriteFailed(usize),
}

/// Download progress snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub pieces_done: usize,
    pub pieces_total: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl Progress {
    pub fn bytes_left(&self) -> u64 {
        self.bytes_total - self.bytes_done
    }
}

/// What the scheduler knows about one connected peer.
#[derive(Debug, Default)]
struct PeerView {
    /// Pieces the peer announced
    have: HashSet<usize>,
    /// Blocks currently claimed by the peer, as (piece, offset)
    in_flight: HashSet<(usize, usize)>,
}

enum Received {
    Ignored,
    Stored,
    Verified(Vec<u8>),
    Corrupt,
}

struct ManagerState {
    pieces: Vec<Piece>,
    peers: HashMap<PeerHandle, PeerView>,
    /// Verified pieces whose disk write has not returned yet
    writing: HashSet<usize>,
    pieces_written: usize,
    bytes_written: u64,
    total_length: u64,
}

impl ManagerState {
    fn is_complete(&self) -> bool {
        self.pieces_written == self.pieces.len() && self.writing.is_empty()
    }

    fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Pending pieces first, so partially fetched pieces finish before new
    /// ones start. Otherwise the lowest index the peer has.
    fn pick_piece(&self, view: &PeerView) -> Option<usize> {
        let wanted = |p: &&Piece| view.have.contains(&p.index) && p.next_unrequested().is_some();

        self.pieces
            .iter()
            .filter(|p| p.status == PieceStatus::Pending)
            .find(wanted)
            .or_else(|| {
                self.pieces
                    .iter()
                    .filter(|p| p.status == PieceStatus::Missing)
                    .find(wanted)
            })
            .map(|p| p.index)
    }

    fn next_request(&mut self, peer: PeerHandle, now: Instant) -> Option<BlockRequest> {
        let view = self.peers.get(&peer)?;
        let index = self.pick_piece(view)?;

        let piece = &mut self.pieces[index];
        let block = piece.next_unrequested()?;
        let request = BlockRequest {
            index,
            begin: block.offset,
            length: block.length,
        };

        if !piece.claim(request.begin, peer, now) {
            return None;
        }
        if let Some(view) = self.peers.get_mut(&peer) {
            view.in_flight.insert((request.index, request.begin));
        }
        Some(request)
    }

    fn receive(&mut self, peer: PeerHandle, index: usize, begin: usize, data: Vec<u8>) -> Received {
        let Some(piece) = self.pieces.get_mut(index) else {
            return Received::Ignored;
        };
        if piece.is_done() || !piece.receive(begin, &peer, data) {
            return Received::Ignored;
        }
        if let Some(view) = self.peers.get_mut(&peer) {
            view.in_flight.remove(&(index, begin));
        }
        if !piece.is_fully_received() {
            return Received::Stored;
        }

        match piece.verify() {
            Verification::Valid(bytes) => {
                self.writing.insert(index);
                Received::Verified(bytes)
            }
            Verification::Corrupt => Received::Corrupt,
        }
    }

    fn finish_write(&mut self, index: usize, written: bool) {
        self.writing.remove(&index);
        if written {
            self.pieces_written += 1;
            self.bytes_written += self.pieces[index].length as u64;
        } else {
            self.pieces[index].reset();
        }
    }

    fn release_claims(&mut self, peer: &PeerHandle, claims: HashSet<(usize, usize)>) -> usize {
        let mut released = 0;
        for (index, begin) in claims {
            if self.pieces[index].release(begin, peer) {
                released += 1;
            }
        }
        released
    }

    fn progress(&self) -> Progress {
        Progress {
            pieces_done: self.pieces_written,
            pieces_total: self.pieces.len(),
            bytes_done: self.bytes_written,
            bytes_total: self.total_length,
        }
    }
}

/// The piece/block scheduler shared by every peer connection.
pub struct PieceManager {
    state: Mutex<ManagerState>,
    writer: Arc<dyn PieceWriter>,
    completed: watch::Sender<bool>,
}

impl PieceManager {
    /// Builds the piece table for `torrent`.
    pub fn new(
        torrent: &Torrent,
        block_size: usize,
        writer: Arc<dyn PieceWriter>,
    ) -> Result<Self, ApplicationError> {
        Self::from_layout(
            torrent.piece_length(),
            torrent.total_length(),
            torrent.piece_hashes(),
            block_size,
            writer,
        )
    }

    /// Builds the piece table from raw layout values.
    ///
    /// Fails when the hash count does not match the number of pieces the
    /// lengths imply.
    pub fn from_layout(
        piece_length: u64,
        total_length: u64,
        hashes: Vec<[u8; 20]>,
        block_size: usize,
        writer: Arc<dyn PieceWriter>,
    ) -> Result<Self, ApplicationError> {
        if piece_length == 0 || block_size == 0 {
            return Err(ApplicationError::ParserError(
                "piece length and block size must be positive".into(),
            ));
        }

        let count = total_length.div_ceil(piece_length) as usize;
        if hashes.len() != count {
            return Err(ApplicationError::ParserError(format!(
                "{} bytes in pieces of {} need {} hashes, metadata has {}",
                total_length,
                piece_length,
                count,
                hashes.len()
            )));
        }

        let pieces: Vec<Piece> = hashes
            .into_iter()
            .enumerate()
            .map(|(i, hash)| {
                let start = i as u64 * piece_length;
                let len = std::cmp::min(piece_length, total_length - start) as usize;
                Piece::new(i, len, hash, block_size)
            })
            .collect();

        let state = ManagerState {
            pieces,
            peers: HashMap::new(),
            writing: HashSet::new(),
            pieces_written: 0,
            bytes_written: 0,
            total_length,
        };
        let (completed, _) = watch::channel(state.is_complete());

        Ok(Self {
            state: Mutex::new(state),
            writer,
            completed,
        })
    }

    /// Notified with `true` once every piece is verified and written.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }

    pub async fn piece_count(&self) -> usize {
        self.state.lock().await.piece_count()
    }

    /// Merges a peer's bitfield (already expanded to indices).
    pub async fn add_peer_bitfield(&self, peer: PeerHandle, pieces: HashSet<usize>) {
        let mut state = self.state.lock().await;
        let count = state.piece_count();
        let view = state.peers.entry(peer).or_default();
        view.have.extend(pieces.into_iter().filter(|i| *i < count));
        debug!(%peer, pieces = view.have.len(), "bitfield merged");
    }

    /// Records a `have`. Returns false for an index outside the torrent.
    pub async fn update_peer_have(&self, peer: PeerHandle, index: usize) -> bool {
        let mut state = self.state.lock().await;
        if index >= state.piece_count() {
            return false;
        }
        state.peers.entry(peer).or_default().have.insert(index);
        true
    }

    /// Drops a peer, returning its claimed blocks to the pool.
    pub async fn remove_peer(&self, peer: PeerHandle) {
        let mut state = self.state.lock().await;
        if let Some(view) = state.peers.remove(&peer) {
            let released = state.release_claims(&peer, view.in_flight);
            debug!(%peer, released, "peer removed");
        }
    }

    /// Gives back every claim of `peer` but keeps what it has announced.
    pub async fn release_peer_requests(&self, peer: PeerHandle) -> usize {
        let mut state = self.state.lock().await;
        let claims = match state.peers.get_mut(&peer) {
            Some(view) => std::mem::take(&mut view.in_flight),
            None => return 0,
        };
        state.release_claims(&peer, claims)
    }

    /// Gives back a single claim, e.g. after the peer let it time out.
    pub async fn release_request(&self, peer: PeerHandle, index: usize, begin: usize) -> bool {
        let mut state = self.state.lock().await;
        let Some(view) = state.peers.get_mut(&peer) else {
            return false;
        };
        if !view.in_flight.remove(&(index, begin)) {
            return false;
        }
        state.pieces[index].release(begin, &peer)
    }

    /// Picks the next block for `peer` and claims it.
    pub async fn next_request(&self, peer: PeerHandle) -> Option<BlockRequest> {
        self.state.lock().await.next_request(peer, Instant::now())
    }

    /// Accepts block data from `peer`.
    ///
    /// Duplicate, late, or unsolicited blocks are ignored. When the block
    /// completes its piece the piece is hashed; a verified piece is written
    /// after the lock is released.
    pub async fn block_received(
        &self,
        peer: PeerHandle,
        index: usize,
        begin: usize,
        data: Vec<u8>,
    ) -> BlockOutcome {
        let received = self.state.lock().await.receive(peer, index, begin, data);

        let bytes = match received {
            Received::Ignored => {
                debug!(%peer, piece = index, begin, "ignoring unexpected block");
                return BlockOutcome::Ignored;
            }
            Received::Stored => return BlockOutcome::Stored,
            Received::Corrupt => {
                warn!(%peer, piece = index, "piece failed hash check, downloading again");
                return BlockOutcome::PieceCorrupt(index);
            }
            Received::Verified(bytes) => bytes,
        };

        let written = self.writer.write_piece(index, &bytes).await;

        let mut state = self.state.lock().await;
        match written {
            Ok(()) => {
                state.finish_write(index, true);
                let progress = state.progress();
                debug!(
                    piece = index,
                    done = progress.pieces_done,
                    total = progress.pieces_total,
                    "piece verified"
                );
                if state.is_complete() {
                    info!("all {} pieces verified", progress.pieces_total);
                    self.completed.send_replace(true);
                }
                BlockOutcome::PieceDone(index)
            }
            Err(e) => {
                error!(piece = index, error = %e, "could not persist piece");
                state.finish_write(index, false);
                BlockOutcome::WriteFailed(index)
            }
        }
    }

    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.is_complete()
    }

    /// Releases claims older than `timeout` so a stalled peer cannot starve
    /// the download. Returns the number of blocks freed.
    pub async fn sweep_stale(&self, timeout: Duration) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut freed = Vec::new();
        for piece in state
            .pieces
            .iter_mut()
            .filter(|p| p.status == PieceStatus::Pending)
        {
            for (peer, begin) in piece.release_stale(now, timeout) {
                freed.push((peer, piece.index, begin));
            }
        }

        for (peer, index, begin) in &freed {
            if let Some(view) = state.peers.get_mut(peer) {
                view.in_flight.remove(&(*index, *begin));
            }
        }

        if !freed.is_empty() {
            debug!(blocks = freed.len(), "released stale requests");
        }
        freed.len()
    }

    pub async fn progress(&self) -> Progress {
        self.state.lock().await.progress()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn piece_status(&self, index: usize) -> Option<PieceStatus> {
        self.state.lock().await.pieces.get(index).map(|p| p.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BlockState;
    use async_trait::async_trait;
    use sha1::{Digest, Sha1};
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    const BLOCK: usize = 16 * 1024;

    #[derive(Default)]
    struct RecordingWriter {
        writes: StdMutex<Vec<(usize, Vec<u8>)>>,
        fail: bool,
    }

    #[async_trait]
    impl PieceWriter for RecordingWriter {
        async fn write_piece(&self, index: usize, data: &[u8]) -> Result<(), ApplicationError> {
            if self.fail {
                return Err(ApplicationError::StorageError("disk full".into()));
            }
            self.writes.lock().unwrap().push((index, data.to_vec()));
            Ok(())
        }
    }

    fn peer(port: u16) -> PeerHandle {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn hash_of(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn all(count: usize) -> HashSet<usize> {
        (0..count).collect()
    }

    /// `count` pieces of `piece_len` bytes, piece `i` filled with byte `i`.
    fn layout(count: usize, piece_len: usize) -> (Vec<Vec<u8>>, Vec<[u8; 20]>) {
        let data: Vec<Vec<u8>> = (0..count).map(|i| vec![i as u8; piece_len]).collect();
        let hashes = data.iter().map(|d| hash_of(d)).collect();
        (data, hashes)
    }

    fn manager(
        count: usize,
        piece_len: usize,
        writer: Arc<RecordingWriter>,
    ) -> (PieceManager, Vec<Vec<u8>>) {
        let (data, hashes) = layout(count, piece_len);
        let manager = PieceManager::from_layout(
            piece_len as u64,
            (count * piece_len) as u64,
            hashes,
            BLOCK,
            writer,
        )
        .unwrap();
        (manager, data)
    }

    #[test]
    fn layout_must_match_hash_count() {
        let writer = Arc::new(RecordingWriter::default());
        let err = PieceManager::from_layout(10, 25, vec![[0; 20]; 2], 4, writer.clone())
            .err()
            .unwrap();
        assert!(matches!(err, ApplicationError::ParserError(_)));

        assert!(PieceManager::from_layout(0, 25, vec![], 4, writer).is_err());
    }

    #[tokio::test]
    async fn last_piece_is_shorter() {
        let writer = Arc::new(RecordingWriter::default());
        let manager =
            PieceManager::from_layout(10, 25, vec![[0; 20]; 3], 4, writer).unwrap();
        let state = manager.state.lock().await;
        assert_eq!(state.pieces[0].length, 10);
        assert_eq!(state.pieces[2].length, 5);
        assert_eq!(state.pieces[2].blocks.len(), 2);
        assert_eq!(state.pieces[2].blocks[1].length, 1);
    }

    #[tokio::test]
    async fn two_peers_share_one_piece() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, data) = manager(1, 2 * BLOCK, writer.clone());
        let (a, b) = (peer(1), peer(2));

        manager.add_peer_bitfield(a, all(1)).await;
        manager.add_peer_bitfield(b, all(1)).await;

        let first = manager.next_request(a).await.unwrap();
        let second = manager.next_request(b).await.unwrap();
        assert_eq!((first.index, first.begin, first.length), (0, 0, BLOCK));
        assert_eq!((second.index, second.begin, second.length), (0, BLOCK, BLOCK));

        let piece = &data[0];
        assert_eq!(
            manager.block_received(a, 0, 0, piece[..BLOCK].to_vec()).await,
            BlockOutcome::Stored
        );
        assert_eq!(
            manager.block_received(b, 0, BLOCK, piece[BLOCK..].to_vec()).await,
            BlockOutcome::PieceDone(0)
        );

        assert!(manager.is_complete().await);
        assert!(*manager.subscribe().borrow());

        let writes = writer.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0);
        assert_eq!(writes[0].1.len(), 2 * BLOCK);
        assert_eq!(hash_of(&writes[0].1), hash_of(piece));
    }

    #[tokio::test]
    async fn duplicate_block_does_not_rewrite() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, data) = manager(1, BLOCK, writer.clone());
        let a = peer(1);
        manager.add_peer_bitfield(a, all(1)).await;

        manager.next_request(a).await.unwrap();
        assert_eq!(
            manager.block_received(a, 0, 0, data[0].clone()).await,
            BlockOutcome::PieceDone(0)
        );
        assert_eq!(
            manager.block_received(a, 0, 0, data[0].clone()).await,
            BlockOutcome::Ignored
        );
        assert_eq!(writer.writes.lock().unwrap().len(), 1);
        assert_eq!(manager.progress().await.pieces_done, 1);
    }

    #[tokio::test]
    async fn unsolicited_and_misfit_blocks_are_ignored() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, data) = manager(2, BLOCK, writer.clone());
        let (a, b) = (peer(1), peer(2));
        manager.add_peer_bitfield(a, all(2)).await;
        manager.add_peer_bitfield(b, all(2)).await;

        let request = manager.next_request(a).await.unwrap();
        // not requested by b
        assert_eq!(
            manager.block_received(b, request.index, 0, data[0].clone()).await,
            BlockOutcome::Ignored
        );
        // wrong length
        assert_eq!(
            manager.block_received(a, request.index, 0, vec![0; 10]).await,
            BlockOutcome::Ignored
        );
        // out of range piece
        assert_eq!(
            manager.block_received(a, 9, 0, data[0].clone()).await,
            BlockOutcome::Ignored
        );
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_mismatch_makes_piece_selectable_again() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(1, 2 * BLOCK, writer.clone());
        let a = peer(1);
        manager.add_peer_bitfield(a, all(1)).await;

        for _ in 0..2 {
            let r = manager.next_request(a).await.unwrap();
            manager.block_received(a, r.index, r.begin, vec![0xEE; r.length]).await;
        }

        assert_eq!(manager.piece_status(0).await, Some(PieceStatus::Missing));
        {
            let state = manager.state.lock().await;
            assert!(
                state.pieces[0]
                    .blocks
                    .iter()
                    .all(|b| b.state == BlockState::NotRequested)
            );
        }
        let again = manager.next_request(a).await.unwrap();
        assert_eq!((again.index, again.begin), (0, 0));
        assert!(writer.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_block_yields_exactly_one_outcome() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, data) = manager(2, 2 * BLOCK, writer.clone());
        let a = peer(1);
        manager.add_peer_bitfield(a, all(2)).await;

        // piece 0 good, piece 1 corrupt
        let mut outcomes = Vec::new();
        while let Some(r) = manager.next_request(a).await {
            let bytes = if r.index == 0 {
                data[0][r.begin..r.begin + r.length].to_vec()
            } else {
                vec![0xAB; r.length]
            };
            let outcome = manager.block_received(a, r.index, r.begin, bytes).await;
            outcomes.push(outcome);
            if matches!(outcome, BlockOutcome::PieceCorrupt(_)) {
                break;
            }
        }

        assert_eq!(
            outcomes,
            vec![
                BlockOutcome::Stored,
                BlockOutcome::PieceDone(0),
                BlockOutcome::Stored,
                BlockOutcome::PieceCorrupt(1),
            ]
        );
        assert_eq!(manager.piece_status(0).await, Some(PieceStatus::Done));
        assert_eq!(manager.piece_status(1).await, Some(PieceStatus::Missing));
    }

    #[tokio::test]
    async fn pending_pieces_are_finished_first() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(3, 2 * BLOCK, writer);
        let (a, b) = (peer(1), peer(2));

        manager.add_peer_bitfield(a, HashSet::from([1])).await;
        manager.add_peer_bitfield(b, all(3)).await;

        let first = manager.next_request(a).await.unwrap();
        assert_eq!((first.index, first.begin), (1, 0));

        // b could start piece 0 but should help finish piece 1
        let second = manager.next_request(b).await.unwrap();
        assert_eq!((second.index, second.begin), (1, BLOCK));

        // piece 1 fully claimed, b moves on to the lowest missing piece
        let third = manager.next_request(b).await.unwrap();
        assert_eq!((third.index, third.begin), (0, 0));

        // a has nothing else it can serve
        assert_eq!(manager.next_request(a).await, None);
    }

    #[tokio::test]
    async fn peer_without_view_gets_nothing() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(1, BLOCK, writer);
        assert_eq!(manager.next_request(peer(1)).await, None);
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn have_outside_torrent_is_rejected() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(2, BLOCK, writer);
        assert!(manager.update_peer_have(peer(1), 1).await);
        assert!(!manager.update_peer_have(peer(1), 2).await);

        let request = manager.next_request(peer(1)).await.unwrap();
        assert_eq!(request.index, 1);
    }

    #[tokio::test]
    async fn removed_peer_blocks_are_reclaimable() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(1, BLOCK, writer);
        let (a, b) = (peer(1), peer(2));
        manager.add_peer_bitfield(a, all(1)).await;
        manager.add_peer_bitfield(b, all(1)).await;

        let held = manager.next_request(a).await.unwrap();
        assert_eq!(manager.next_request(b).await, None);

        manager.remove_peer(a).await;
        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(manager.next_request(b).await, Some(held));
    }

    #[tokio::test]
    async fn choked_peer_releases_but_keeps_view() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(1, 2 * BLOCK, writer);
        let a = peer(1);
        manager.add_peer_bitfield(a, all(1)).await;

        manager.next_request(a).await.unwrap();
        manager.next_request(a).await.unwrap();
        assert_eq!(manager.release_peer_requests(a).await, 2);
        assert_eq!(manager.piece_status(0).await, Some(PieceStatus::Missing));

        let again = manager.next_request(a).await.unwrap();
        assert_eq!(again.begin, 0);
    }

    #[tokio::test]
    async fn single_release_frees_one_block() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(1, 2 * BLOCK, writer);
        let (a, b) = (peer(1), peer(2));
        manager.add_peer_bitfield(a, all(1)).await;
        manager.add_peer_bitfield(b, all(1)).await;

        let r = manager.next_request(a).await.unwrap();
        assert!(!manager.release_request(b, r.index, r.begin).await);
        assert!(manager.release_request(a, r.index, r.begin).await);
        assert!(!manager.release_request(a, r.index, r.begin).await);
        assert_eq!(manager.next_request(b).await, Some(r));
    }

    #[tokio::test]
    async fn stale_requests_are_swept() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, data) = manager(1, BLOCK, writer);
        let (a, b) = (peer(1), peer(2));
        manager.add_peer_bitfield(a, all(1)).await;
        manager.add_peer_bitfield(b, all(1)).await;

        let r = manager.next_request(a).await.unwrap();
        assert_eq!(manager.sweep_stale(Duration::from_secs(60)).await, 0);
        assert_eq!(manager.sweep_stale(Duration::ZERO).await, 1);

        // a's late delivery no longer counts, b can take over
        assert_eq!(
            manager.block_received(a, 0, 0, data[0].clone()).await,
            BlockOutcome::Ignored
        );
        assert_eq!(manager.next_request(b).await, Some(r));
    }

    #[tokio::test]
    async fn failed_write_resets_piece() {
        let writer = Arc::new(RecordingWriter {
            fail: true,
            ..Default::default()
        });
        let (manager, data) = manager(1, BLOCK, writer);
        let a = peer(1);
        manager.add_peer_bitfield(a, all(1)).await;

        manager.next_request(a).await.unwrap();
        assert_eq!(
            manager.block_received(a, 0, 0, data[0].clone()).await,
            BlockOutcome::WriteFailed(0)
        );
        assert!(!manager.is_complete().await);
        assert_eq!(manager.piece_status(0).await, Some(PieceStatus::Missing));
        assert!(manager.next_request(a).await.is_some());
    }

    #[tokio::test]
    async fn progress_tracks_written_bytes() {
        let writer = Arc::new(RecordingWriter::default());
        let manager =
            PieceManager::from_layout(4, 6, vec![hash_of(b"abcd"), hash_of(b"ef")], 4, writer)
                .unwrap();
        let a = peer(1);
        manager.add_peer_bitfield(a, all(2)).await;

        let r = manager.next_request(a).await.unwrap();
        manager.block_received(a, r.index, r.begin, b"abcd".to_vec()).await;

        let progress = manager.progress().await;
        assert_eq!(progress.pieces_done, 1);
        assert_eq!(progress.bytes_done, 4);
        assert_eq!(progress.bytes_left(), 2);
    }

    #[test]
    fn empty_torrent_starts_complete() {
        let writer = Arc::new(RecordingWriter::default());
        let manager = PieceManager::from_layout(16, 0, vec![], 4, writer).unwrap();
        assert!(*manager.subscribe().borrow());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_share_a_block() {
        let writer = Arc::new(RecordingWriter::default());
        let (manager, _) = manager(8, 4 * BLOCK, writer);
        let manager = Arc::new(manager);

        for port in 0..16 {
            manager.add_peer_bitfield(peer(port), all(8)).await;
        }

        let mut tasks = Vec::new();
        for port in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(r) = manager.next_request(peer(port)).await {
                    got.push(r);
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for r in task.await.unwrap() {
                assert!(seen.insert((r.index, r.begin)), "block {:?} handed out twice", r);
            }
        }
        assert_eq!(seen.len(), 8 * 4);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Request(u16),
            Remove(u16),
            Sweep,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (0u16..4).prop_map(Op::Request),
                1 => (0u16..4).prop_map(Op::Remove),
                1 => Just(Op::Sweep),
            ]
        }

        proptest! {
            #[test]
            fn claims_stay_exclusive(ops in proptest::collection::vec(op(), 1..80)) {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    let writer = Arc::new(RecordingWriter::default());
                    let (manager, _) = manager(3, 3 * BLOCK, writer);
                    let mut held: HashMap<(usize, usize), u16> = HashMap::new();

                    for op in ops {
                        match op {
                            Op::Request(p) => {
                                manager.add_peer_bitfield(peer(p), all(3)).await;
                                if let Some(r) = manager.next_request(peer(p)).await {
                                    let prev = held.insert((r.index, r.begin), p);
                                    assert!(prev.is_none(), "{:?} claimed twice", r);
                                }
                            }
                            Op::Remove(p) => {
                                manager.remove_peer(peer(p)).await;
                                held.retain(|_, owner| *owner != p);
                            }
                            Op::Sweep => {
                                manager.sweep_stale(Duration::ZERO).await;
                                held.clear();
                            }
                        }
                    }

                    // whatever is still held is exactly what the table says
                    let state = manager.state.lock().await;
                    for piece in &state.pieces {
                        for block in &piece.blocks {
                            let owner = held.get(&(piece.index, block.offset)).map(|p| peer(*p));
                            match owner {
                                Some(owner) => assert!(block.is_requested_by(&owner)),
                                None => assert_eq!(block.state, BlockState::NotRequested),
                            }
                        }
                    }
                });
            }
        }
    }
}
