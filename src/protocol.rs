use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashSet;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Length of the full handshake message (always 68 bytes)
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame body we are willing to buffer.
///
/// A 16 KiB block plus header is far below this; so is the bitfield of any
/// torrent with fewer than 16 million pieces.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

/// Represents a BitTorrent handshake message.
///
/// A handshake is the first message sent in a connection and is always 68 bytes.
/// It identifies the torrent being requested (`info_hash`) and the client (`peer_id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// SHA-1 hash of the info dictionary from the .torrent file
    pub info_hash: [u8; 20],
    /// 20-byte string used to identify the client
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates a new `Handshake` with the given `info_hash` and `peer_id`.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encodes the handshake into a 68-byte array.
    ///
    /// This array can be written directly to a TCP stream.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..1 + PROTOCOL_STR.len()].copy_from_slice(PROTOCOL_STR.as_bytes());
        // reserved bytes [20..28] stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Decodes a 68-byte handshake message.
    ///
    /// Reserved bytes are not inspected, peers are free to advertise extensions
    /// we do not speak.
    pub fn decode(buf: &[u8]) -> Result<Self, ApplicationError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(ApplicationError::ProtocolError(format!(
                "handshake must be {} bytes, got {}",
                HANDSHAKE_LEN,
                buf.len()
            )));
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != PROTOCOL_STR.len() {
            return Err(ApplicationError::ProtocolError(
                "invalid protocol string length".into(),
            ));
        }

        if &buf[1..1 + pstrlen] != PROTOCOL_STR.as_bytes() {
            return Err(ApplicationError::ProtocolError(
                "invalid protocol string".into(),
            ));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Represents a protocol message exchanged after the handshake.
///
/// These messages follow the BitTorrent peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// zero-length frame keeping an idle connection open
    KeepAlive,
    /// `choke` message: tells the peer it will not receive requests
    Choke,
    /// `unchoke` message: peer is allowed to request blocks
    Unchoke,
    /// `interested` message: client is interested in pieces from peer
    Interested,
    /// `not interested` message: client is not interested
    NotInterested,
    /// `have` message: peer has a specific piece
    Have(u32),
    /// `bitfield` message: bitmap of pieces the peer has
    Bitfield(Vec<u8>),
    /// `request` message: request a block of data
    Request { index: u32, begin: u32, length: u32 },
    /// `piece` message: sends a block of a piece
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// `cancel` message: cancels a previously sent request
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id we do not know. Kept so newer peers do not get disconnected.
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Unknown { .. } => "unknown",
        }
    }

    /// Serializes a `Message` into a byte vector for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into<B: BufMut>(&self, buf: &mut B) {
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(buf, ID_CHOKE, 0),
            Message::Unchoke => put_header(buf, ID_UNCHOKE, 0),
            Message::Interested => put_header(buf, ID_INTERESTED, 0),
            Message::NotInterested => put_header(buf, ID_NOT_INTERESTED, 0),
            Message::Have(index) => {
                put_header(buf, ID_HAVE, 4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bitfield) => {
                put_header(buf, ID_BITFIELD, bitfield.len());
                buf.put_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(buf, ID_REQUEST, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                put_header(buf, ID_PIECE, 8 + block.len());
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(buf, ID_CANCEL, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id, payload } => {
                put_header(buf, *id, payload.len());
                buf.put_slice(payload);
            }
        }
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole frame, the
    /// caller keeps the bytes and retries once more have arrived. On success
    /// the number of bytes consumed is returned alongside the message.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ApplicationError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut cursor = buf;
        let len = cursor.read_u32::<BigEndian>().map_err(malformed)? as usize;

        if len > MAX_FRAME_LEN {
            return Err(ApplicationError::ProtocolError(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }

        if len == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }

        if cursor.len() < len {
            return Ok(None);
        }

        let message = Self::decode_body(&cursor[..len])?;
        Ok(Some((message, 4 + len)))
    }

    /// Parses a frame body (id + payload, without the length prefix).
    fn decode_body(mut body: &[u8]) -> Result<Self, ApplicationError> {
        let id = body.read_u8().map_err(malformed)?;
        let payload_len = body.len();

        match id {
            ID_CHOKE => Ok(Message::Choke),
            ID_UNCHOKE => Ok(Message::Unchoke),
            ID_INTERESTED => Ok(Message::Interested),
            ID_NOT_INTERESTED => Ok(Message::NotInterested),
            ID_HAVE => {
                expect_payload("have", payload_len, 4)?;
                let index = body.read_u32::<BigEndian>().map_err(malformed)?;
                Ok(Message::Have(index))
            }
            ID_BITFIELD => Ok(Message::Bitfield(body.to_vec())),
            ID_REQUEST | ID_CANCEL => {
                let name = if id == ID_REQUEST { "request" } else { "cancel" };
                expect_payload(name, payload_len, 12)?;
                let index = body.read_u32::<BigEndian>().map_err(malformed)?;
                let begin = body.read_u32::<BigEndian>().map_err(malformed)?;
                let length = body.read_u32::<BigEndian>().map_err(malformed)?;
                if id == ID_REQUEST {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    })
                } else {
                    Ok(Message::Cancel {
                        index,
                        begin,
                        length,
                    })
                }
            }
            ID_PIECE => {
                if payload_len < 8 {
                    return Err(ApplicationError::ProtocolError(
                        "invalid piece message length".into(),
                    ));
                }
                let index = body.read_u32::<BigEndian>().map_err(malformed)?;
                let begin = body.read_u32::<BigEndian>().map_err(malformed)?;
                Ok(Message::Piece {
                    index,
                    begin,
                    block: body.to_vec(),
                })
            }
            _ => Ok(Message::Unknown {
                id,
                payload: body.to_vec(),
            }),
        }
    }
}

fn put_header<B: BufMut>(buf: &mut B, id: u8, payload_len: usize) {
    buf.put_u32((1 + payload_len) as u32);
    buf.put_u8(id);
}

fn expect_payload(name: &str, actual: usize, expected: usize) -> Result<(), ApplicationError> {
    if actual != expected {
        return Err(ApplicationError::ProtocolError(format!(
            "invalid {} message length: {} (expected {})",
            name, actual, expected
        )));
    }
    Ok(())
}

fn malformed(e: io::Error) -> ApplicationError {
    ApplicationError::ProtocolError(format!("protocol: {}", e))
}

/// Expands a bitfield payload into the set of piece indices it marks.
///
/// Bits are MSB-first per byte. Spare bits past `piece_count` are dropped.
pub fn bitfield_to_indices(bytes: &[u8], piece_count: usize) -> HashSet<usize> {
    let mut pieces = HashSet::new();
    for (i, byte) in bytes.iter().enumerate() {
        for bit in 0..8 {
            let index = i * 8 + bit;
            if index >= piece_count {
                return pieces;
            }
            if byte & (0b1000_0000 >> bit) != 0 {
                pieces.insert(index);
            }
        }
    }
    pieces
}

/// Packs piece indices into a bitfield payload of `ceil(piece_count / 8)` bytes.
pub fn indices_to_bitfield<I>(indices: I, piece_count: usize) -> Vec<u8>
where
    I: IntoIterator<Item = usize>,
{
    let mut bytes = vec![0u8; piece_count.div_ceil(8)];
    for index in indices.into_iter().filter(|i| *i < piece_count) {
        bytes[index / 8] |= 0b1000_0000 >> (index % 8);
    }
    bytes
}

/// Frames the 68-byte handshake on a fresh connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = ApplicationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, ApplicationError> {
        if src.len() < HANDSHAKE_LEN {
            src.reserve(HANDSHAKE_LEN - src.len());
            return Ok(None);
        }
        let frame = src.split_to(HANDSHAKE_LEN);
        Handshake::decode(&frame).map(Some)
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = ApplicationError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), ApplicationError> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

/// Frames length-prefixed peer messages once the handshake is done.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ApplicationError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ApplicationError> {
        match Message::decode(src)? {
            Some((message, used)) => {
                src.advance(used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ApplicationError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ApplicationError> {
        item.encode_into(dst);
        Ok(())
    }
}
