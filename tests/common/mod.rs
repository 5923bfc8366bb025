#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use leech::{
    error::ApplicationError,
    protocol::{Handshake, Message, MessageCodec, indices_to_bitfield},
    storage::PieceWriter,
    tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer},
};
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const BLOCK: usize = 16 * 1024;

/// Deterministic, non-repeating payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

pub fn piece_hashes(data: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
    data.chunks(piece_length)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect()
}

/// Keeps every piece handed to it.
#[derive(Default)]
pub struct MemoryWriter {
    pub writes: Mutex<Vec<(usize, Vec<u8>)>>,
}

impl MemoryWriter {
    pub fn count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    /// Writes laid out by piece index.
    pub fn assemble(&self, piece_length: usize, total: usize) -> Vec<u8> {
        let mut out = vec![0u8; total];
        for (index, data) in self.writes.lock().unwrap().iter() {
            let start = index * piece_length;
            out[start..start + data.len()].copy_from_slice(data);
        }
        out
    }
}

#[async_trait]
impl PieceWriter for MemoryWriter {
    async fn write_piece(&self, index: usize, data: &[u8]) -> Result<(), ApplicationError> {
        self.writes.lock().unwrap().push((index, data.to_vec()));
        Ok(())
    }
}

/// Tracker stand-in that always returns the same peers.
pub struct StaticAnnouncer {
    peers: Vec<SocketAddr>,
    pub events: Mutex<Vec<AnnounceEvent>>,
}

impl StaticAnnouncer {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self {
            peers,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnnounceEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Announcer for StaticAnnouncer {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, ApplicationError> {
        self.events.lock().unwrap().push(request.event);
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Some(60),
        })
    }
}

/// A seeding peer on a local socket.
#[derive(Clone)]
pub struct MockPeer {
    pub info_hash: [u8; 20],
    pub data: Arc<Vec<u8>>,
    pub piece_length: usize,
    /// Unchoke right after the bitfield
    pub unchoke: bool,
    /// Number of block replies to garble before serving real data
    pub corrupt_blocks: usize,
    /// Serve `request`s; when false the peer unchokes and then goes quiet
    pub answer_requests: bool,
    /// Answer the first `request` with a `choke` instead of data
    pub choke_on_request: bool,
    /// Every message received, across all connections
    pub received: Arc<Mutex<Vec<Message>>>,
}

impl MockPeer {
    pub fn new(info_hash: [u8; 20], data: Arc<Vec<u8>>, piece_length: usize) -> Self {
        Self {
            info_hash,
            data,
            piece_length,
            unchoke: true,
            corrupt_blocks: 0,
            answer_requests: true,
            choke_on_request: false,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Unchokes, then never sends another byte.
    pub fn silent(info_hash: [u8; 20], data: Arc<Vec<u8>>, piece_length: usize) -> Self {
        Self {
            answer_requests: false,
            ..Self::new(info_hash, data, piece_length)
        }
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn count_received(&self, pred: impl Fn(&Message) -> bool) -> usize {
        self.received.lock().unwrap().iter().filter(|m| pred(m)).count()
    }

    /// Binds a listener and serves every connection it accepts.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let corrupt = Arc::new(Mutex::new(self.corrupt_blocks));
        let this = self.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let peer = this.clone();
                let corrupt = corrupt.clone();
                tokio::spawn(async move {
                    let _ = peer.serve(socket, corrupt).await;
                });
            }
        });
        addr
    }

    async fn serve(self, mut socket: TcpStream, corrupt: Arc<Mutex<usize>>) -> std::io::Result<()> {
        let mut theirs = [0u8; 68];
        socket.read_exact(&mut theirs).await?;

        let piece_count = self.data.len().div_ceil(self.piece_length);

        // handshake, bitfield and unchoke go out in a single write
        let mut opening = Handshake::new(self.info_hash, [0x42; 20]).encode().to_vec();
        opening.extend(Message::Bitfield(indices_to_bitfield(0..piece_count, piece_count)).encode());
        if self.unchoke {
            opening.extend(Message::Unchoke.encode());
        }
        socket.write_all(&opening).await?;

        let mut framed = Framed::new(socket, MessageCodec);
        let mut choked = false;
        while let Some(Ok(message)) = framed.next().await {
            self.received.lock().unwrap().push(message.clone());

            if let Message::Request { index, begin, length } = message {
                if self.choke_on_request {
                    if !choked {
                        choked = true;
                        if framed.send(Message::Choke).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
                if !self.answer_requests {
                    continue;
                }

                let start = index as usize * self.piece_length + begin as usize;
                let mut block = self.data[start..start + length as usize].to_vec();

                let garble = {
                    let mut left = corrupt.lock().unwrap();
                    let garble = *left > 0;
                    *left = left.saturating_sub(1);
                    garble
                };
                if garble {
                    block.iter_mut().for_each(|b| *b = !*b);
                }

                let reply = Message::Piece { index, begin, block };
                if framed.send(reply).await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Answers `started` and never replies to anything after it.
pub struct HangingAnnouncer {
    peers: Vec<SocketAddr>,
}

impl HangingAnnouncer {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Announcer for HangingAnnouncer {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, ApplicationError> {
        if request.event != AnnounceEvent::Started {
            futures::future::pending::<()>().await;
        }
        Ok(AnnounceResponse {
            peers: self.peers.clone(),
            interval: Some(60),
        })
    }
}
