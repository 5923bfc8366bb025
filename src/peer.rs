//! One task per remote peer: connect, handshake, then trade messages with the
//! shared [`PieceManager`] until the download completes or the pool stops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{self, MissedTickBehavior, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::ClientConfig,
    error::ApplicationError,
    manager::{BlockOutcome, BlockRequest, PieceManager},
    protocol::{Handshake, HandshakeCodec, Message, MessageCodec, bitfield_to_indices},
};

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Why a connection ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The pool asked every connection to stop
    Stopped,
    /// Every piece is verified and written
    Completed,
}

/// Choke and interest flags of one connection. Both sides start choked and
/// not interested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// The remote is choking us
    pub am_choked:       bool,
    pub am_interested:   bool,
    pub peer_interested: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            am_choked:       true,
            am_interested:   false,
            peer_interested: false,
        }
    }
}

impl ConnectionState {
    /// Returns true if we were unchoked before.
    pub fn choke(&mut self) -> bool {
        !std::mem::replace(&mut self.am_choked, true)
    }

    pub fn unchoke(&mut self) {
        self.am_choked = false;
    }

    pub fn set_peer_interested(&mut self, interested: bool) {
        self.peer_interested = interested;
    }

    pub fn declare_interest(&mut self) {
        self.am_interested = true;
    }

    pub fn can_request(&self) -> bool {
        self.am_interested && !self.am_choked
    }
}

/// Everything a connection shares with the rest of the client.
#[derive(Clone)]
pub struct PeerContext {
    pub info_hash: [u8; 20],
    pub manager:   Arc<PieceManager>,
    pub config:    Arc<ClientConfig>,
}

/// Runs a connection to `addr` to the end.
///
/// Whatever happens, the peer is removed from the scheduler before this
/// returns, so its claimed blocks go back to the pool.
pub async fn run(
    addr: SocketAddr,
    ctx: PeerContext,
    cancel: CancellationToken,
) -> Result<CloseReason, ApplicationError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(CloseReason::Stopped),
        conn = PeerConnection::connect(addr, &ctx) => match conn {
            Ok(conn) => conn.run(&cancel).await,
            Err(e) => Err(e),
        },
    };

    ctx.manager.remove_peer(addr).await;

    match &result {
        Ok(reason) => debug!(%addr, phase = ?PeerPhase::Closed, ?reason, "connection closed"),
        Err(e) if e.is_protocol() => {
            warn!(%addr, phase = ?PeerPhase::Closed, error = %e, "connection closed")
        }
        Err(e) => debug!(%addr, phase = ?PeerPhase::Closed, error = %e, "connection closed"),
    }
    result
}

/// An outstanding request and when it went out
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    request: BlockRequest,
    sent_at: Instant,
}

/// Manages the connection to a peer once the handshake went through
pub struct PeerConnection {
    addr:          SocketAddr,
    framed:        Framed<TcpStream, MessageCodec>,
    remote_id:     [u8; 20],
    state:         ConnectionState,
    outstanding:   HashMap<(usize, usize), Outstanding>,
    manager:       Arc<PieceManager>,
    config:        Arc<ClientConfig>,
    piece_count:   usize,
    last_received: Instant,
    last_sent:     Instant,
    /// Set when a request timed out; no new requests until a block arrives
    stalled:       bool,
}

impl PeerConnection {
    /// Opens the TCP connection and exchanges handshakes.
    ///
    /// A remote answering for another torrent is a protocol error; nothing is
    /// registered with the scheduler in that case.
    pub async fn connect(addr: SocketAddr, ctx: &PeerContext) -> Result<Self, ApplicationError> {
        debug!(%addr, phase = ?PeerPhase::Connecting, "connecting");
        let stream = timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ApplicationError::PeerError("connect timed out".into()))?
            .map_err(|e| ApplicationError::PeerError(e.to_string()))?;

        debug!(%addr, phase = ?PeerPhase::Handshaking, "handshaking");
        let mut framed = Framed::new(stream, HandshakeCodec);
        let theirs = timeout(
            ctx.config.handshake_timeout,
            exchange_handshake(&mut framed, Handshake::new(ctx.info_hash, ctx.config.peer_id)),
        )
        .await
        .map_err(|_| ApplicationError::PeerError("handshake timed out".into()))??;

        if theirs.info_hash != ctx.info_hash {
            return Err(ApplicationError::ProtocolError(format!(
                "info hash mismatch: got {}",
                hex::encode(theirs.info_hash)
            )));
        }

        // Whatever the remote sent right after its handshake stays buffered
        let framed = framed.map_codec(|_| MessageCodec);
        let now = Instant::now();

        Ok(Self {
            addr,
            framed,
            remote_id: theirs.peer_id,
            state: ConnectionState::default(),
            outstanding: HashMap::new(),
            manager: ctx.manager.clone(),
            config: ctx.config.clone(),
            piece_count: ctx.manager.piece_count().await,
            last_received: now,
            last_sent: now,
            stalled: false,
        })
    }

    /// Trades messages until stopped, completed, or the connection fails.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<CloseReason, ApplicationError> {
        debug!(
            addr = %self.addr,
            phase = ?PeerPhase::Active,
            remote = %String::from_utf8_lossy(&self.remote_id),
            "handshake complete"
        );

        let mut completed = self.manager.subscribe();
        if *completed.borrow() {
            return Ok(CloseReason::Completed);
        }

        self.send(Message::Interested).await?;
        self.state.declare_interest();

        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(CloseReason::Stopped),
                changed = completed.changed() => {
                    if changed.is_err() || *completed.borrow() {
                        return Ok(CloseReason::Completed);
                    }
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => self.handle(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(ApplicationError::PeerError("closed by remote".into())),
                },
                _ = tick.tick() => self.on_tick().await?,
            }

            self.fill_pipeline().await?;
        }
    }

    async fn handle(&mut self, message: Message) -> Result<(), ApplicationError> {
        self.last_received = Instant::now();
        trace!(addr = %self.addr, message = message.name(), "received");

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                if self.state.choke() {
                    // a choking peer discards our queued requests
                    self.outstanding.clear();
                    let released = self.manager.release_peer_requests(self.addr).await;
                    debug!(addr = %self.addr, released, "choked");
                }
            }
            Message::Unchoke => {
                self.state.unchoke();
                self.stalled = false;
                debug!(addr = %self.addr, "unchoked");
            }
            Message::Interested => self.state.set_peer_interested(true),
            Message::NotInterested => self.state.set_peer_interested(false),
            Message::Have(index) => {
                if !self.manager.update_peer_have(self.addr, index as usize).await {
                    debug!(addr = %self.addr, index, "have for a piece outside the torrent");
                }
            }
            Message::Bitfield(bytes) => {
                let pieces = bitfield_to_indices(&bytes, self.piece_count);
                self.manager.add_peer_bitfield(self.addr, pieces).await;
            }
            Message::Piece { index, begin, block } => {
                let (index, begin) = (index as usize, begin as usize);
                self.outstanding.remove(&(index, begin));
                self.stalled = false;

                match self.manager.block_received(self.addr, index, begin, block).await {
                    BlockOutcome::PieceDone(piece) => {
                        debug!(addr = %self.addr, piece, "piece complete")
                    }
                    BlockOutcome::PieceCorrupt(piece) | BlockOutcome::WriteFailed(piece) => {
                        debug!(addr = %self.addr, piece, "piece will be fetched again")
                    }
                    BlockOutcome::Stored | BlockOutcome::Ignored => {}
                }
            }
            // download only
            Message::Request { .. } | Message::Cancel { .. } => {}
            Message::Unknown { id, payload } => {
                trace!(addr = %self.addr, id, len = payload.len(), "ignoring unknown message");
            }
        }
        Ok(())
    }

    /// Tops the request pipeline up to `pipeline_depth`.
    ///
    /// A stalled connection asks for nothing, so the blocks it just timed out
    /// on go to other peers instead of straight back to it.
    async fn fill_pipeline(&mut self) -> Result<(), ApplicationError> {
        if !self.state.can_request() || self.stalled {
            return Ok(());
        }

        let mut queued = false;
        while self.outstanding.len() < self.config.pipeline_depth {
            let Some(request) = self.manager.next_request(self.addr).await else {
                break;
            };
            self.framed.feed(request.request_message()).await?;
            self.outstanding.insert(
                (request.index, request.begin),
                Outstanding {
                    request,
                    sent_at: Instant::now(),
                },
            );
            queued = true;
        }

        if queued {
            self.framed.flush().await?;
            self.last_sent = Instant::now();
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), ApplicationError> {
        let now = Instant::now();

        if now.duration_since(self.last_received) >= self.config.idle_timeout {
            return Err(ApplicationError::PeerError("idle timeout".into()));
        }

        let expired: Vec<BlockRequest> = self
            .outstanding
            .values()
            .filter(|o| now.duration_since(o.sent_at) >= self.config.request_timeout)
            .map(|o| o.request)
            .collect();

        if !expired.is_empty() {
            for request in &expired {
                self.outstanding.remove(&(request.index, request.begin));
                self.framed.feed(request.cancel_message()).await?;
            }
            self.framed.flush().await?;
            for request in &expired {
                self.manager
                    .release_request(self.addr, request.index, request.begin)
                    .await;
            }
            self.last_sent = now;
            self.stalled = true;
            debug!(addr = %self.addr, count = expired.len(), "requests timed out");
        }

        if now.duration_since(self.last_sent) >= self.config.keepalive_interval {
            self.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), ApplicationError> {
        trace!(addr = %self.addr, message = message.name(), "sending");
        self.framed.send(message).await?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

async fn exchange_handshake(
    framed: &mut Framed<TcpStream, HandshakeCodec>,
    ours: Handshake,
) -> Result<Handshake, ApplicationError> {
    framed.send(ours).await?;
    match framed.next().await {
        Some(theirs) => theirs,
        None => Err(ApplicationError::PeerError("closed during handshake".into())),
    }
}
