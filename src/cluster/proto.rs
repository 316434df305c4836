// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Wire format of the membership protocol.
//!
//! Every frame starts with a one byte [MessageType] tag. Message bodies are protobuf
//! encoded, with the exception of user messages (raw bytes) and the wrapper frames
//! (compound, compressed, encrypted), whose layout is fixed:
//!
//! ```text
//! compound:  [7][count: u16][len: u16; count][payload; count]
//! compress:  [9][algo: u8][zlib(inner frame)]
//! encrypt:   [10][version: u8][nonce: 12][aes-gcm(inner frame)]
//! pushpull:  [6][header (delimited)][node (delimited); header.nodes][user state]
//! ```
use super::member::MemberState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use prost::Message as _;
use std::{
    convert::{TryFrom, TryInto},
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr},
};
use thiserror::Error;

/// Overhead of a single part inside of a compound frame.
pub const COMPOUND_OVERHEAD: usize = 2;

/// Overhead of the compound frame header.
pub const COMPOUND_HEADER_OVERHEAD: usize = 3;

/// Largest amount of bytes a compressed frame may inflate to.
pub const MAX_DECOMPRESSED: u64 = 20 * 1024 * 1024;

const ZLIB: u8 = 0;

/// One byte message type tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    User = 8,
    Compress = 9,
    Encrypt = 10,
    Nack = 11,
    Err = 12,
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        use MessageType::*;

        Ok(match tag {
            0 => Ping,
            1 => IndirectPing,
            2 => Ack,
            3 => Suspect,
            4 => Alive,
            5 => Dead,
            6 => PushPull,
            7 => Compound,
            8 => User,
            9 => Compress,
            10 => Encrypt,
            11 => Nack,
            12 => Err,
            _ => return Result::Err(DecodeError::UnknownType(tag)),
        })
    }
}

/// Errors encountered while decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message type: {}", .0)]
    UnknownType(u8),

    #[error("unexpected message type: {:?}", .0)]
    Unexpected(MessageType),

    #[error("truncated frame")]
    Truncated,

    #[error("malformed body: {}", .0)]
    Body(#[from] prost::DecodeError),

    #[error("unknown compression algorithm: {}", .0)]
    UnknownCompression(u8),

    #[error("decompression failed: {}", .0)]
    Decompress(#[source] io::Error),

    #[error("decompressed frame exceeds {} bytes", MAX_DECOMPRESSED)]
    TooLarge,

    #[error("invalid address: {}", .0)]
    Address(#[from] SocketAddrError),

    #[error("invalid member state: {}", .0)]
    State(u32),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Endpoint {
    #[prost(bytes = "vec", tag = "1")]
    pub host: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub port: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(uint32, tag = "1")]
    pub seq_no: u32,
    /// Name of the node we intend to ping. Empty if unknown.
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(message, optional, tag = "3")]
    pub source_addr: Option<Endpoint>,
    #[prost(string, tag = "4")]
    pub source_node: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IndirectPing {
    #[prost(uint32, tag = "1")]
    pub seq_no: u32,
    #[prost(message, optional, tag = "2")]
    pub target: Option<Endpoint>,
    #[prost(string, tag = "3")]
    pub node: String,
    /// Whether the relay should respond with a nack if the target doesn't respond.
    #[prost(bool, tag = "4")]
    pub nack: bool,
    #[prost(message, optional, tag = "5")]
    pub source_addr: Option<Endpoint>,
    #[prost(string, tag = "6")]
    pub source_node: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ack {
    #[prost(uint32, tag = "1")]
    pub seq_no: u32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Nack {
    #[prost(uint32, tag = "1")]
    pub seq_no: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Suspect {
    #[prost(uint32, tag = "1")]
    pub incarnation: u32,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(string, tag = "3")]
    pub from: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Alive {
    #[prost(uint32, tag = "1")]
    pub incarnation: u32,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(message, optional, tag = "3")]
    pub addr: Option<Endpoint>,
    #[prost(bytes = "bytes", tag = "4")]
    pub meta: Bytes,
    /// Protocol min/max/cur, followed by delegate min/max/cur.
    #[prost(bytes = "vec", tag = "5")]
    pub vsn: Vec<u8>,
}

/// A dead claim. If `from == node`, the node left voluntarily.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Dead {
    #[prost(uint32, tag = "1")]
    pub incarnation: u32,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(string, tag = "3")]
    pub from: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrResp {
    #[prost(string, tag = "1")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushPullHeader {
    #[prost(uint32, tag = "1")]
    pub nodes: u32,
    #[prost(uint32, tag = "2")]
    pub user_state_len: u32,
    #[prost(bool, tag = "3")]
    pub join: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushNodeState {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub addr: Option<Endpoint>,
    #[prost(bytes = "bytes", tag = "3")]
    pub meta: Bytes,
    #[prost(uint32, tag = "4")]
    pub incarnation: u32,
    #[prost(uint32, tag = "5")]
    pub state: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub vsn: Vec<u8>,
}

impl PushNodeState {
    pub fn member_state(&self) -> Result<MemberState, DecodeError> {
        MemberState::try_from(self.state).map_err(|_| DecodeError::State(self.state))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, DecodeError> {
        socket_addr(&self.addr)
    }
}

/// A decoded (non-wrapper) protocol message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Ping(Ping),
    IndirectPing(IndirectPing),
    Ack(Ack),
    Nack(Nack),
    Suspect(Suspect),
    Alive(Alive),
    Dead(Dead),
    User(Bytes),
    Err(ErrResp),
}

impl Message {
    /// Returns this message's type tag.
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Ping(_) => MessageType::Ping,
            Message::IndirectPing(_) => MessageType::IndirectPing,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Suspect(_) => MessageType::Suspect,
            Message::Alive(_) => MessageType::Alive,
            Message::Dead(_) => MessageType::Dead,
            Message::User(_) => MessageType::User,
            Message::Err(_) => MessageType::Err,
        }
    }

    /// Encode this message into a tagged frame.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Ping(m) => encode(MessageType::Ping, m),
            Message::IndirectPing(m) => encode(MessageType::IndirectPing, m),
            Message::Ack(m) => encode(MessageType::Ack, m),
            Message::Nack(m) => encode(MessageType::Nack, m),
            Message::Suspect(m) => encode(MessageType::Suspect, m),
            Message::Alive(m) => encode(MessageType::Alive, m),
            Message::Dead(m) => encode(MessageType::Dead, m),
            Message::Err(m) => encode(MessageType::Err, m),
            Message::User(raw) => user_frame(raw),
        }
    }

    /// Decode a tagged frame. Wrapper frames are rejected with [DecodeError::Unexpected];
    /// use [unwrap_frames] to flatten them first.
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        guard_nonempty(&buf)?;
        let kind = MessageType::try_from(buf.get_u8())?;

        Ok(match kind {
            MessageType::Ping => Message::Ping(Ping::decode(buf)?),
            MessageType::IndirectPing => Message::IndirectPing(IndirectPing::decode(buf)?),
            MessageType::Ack => Message::Ack(Ack::decode(buf)?),
            MessageType::Nack => Message::Nack(Nack::decode(buf)?),
            MessageType::Suspect => Message::Suspect(Suspect::decode(buf)?),
            MessageType::Alive => Message::Alive(Alive::decode(buf)?),
            MessageType::Dead => Message::Dead(Dead::decode(buf)?),
            MessageType::Err => Message::Err(ErrResp::decode(buf)?),
            MessageType::User => Message::User(buf),
            kind => return Err(DecodeError::Unexpected(kind)),
        })
    }
}

fn guard_nonempty(buf: &[u8]) -> Result<(), DecodeError> {
    if buf.is_empty() {
        Err(DecodeError::Empty)
    } else {
        Ok(())
    }
}

/// Returns the type tag of a frame.
pub fn peek_type(buf: &[u8]) -> Result<MessageType, DecodeError> {
    guard_nonempty(buf)?;
    MessageType::try_from(buf[0])
}

/// Encode `msg` as a tagged frame.
pub fn encode<M: prost::Message>(kind: MessageType, msg: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + msg.encoded_len());
    buf.put_u8(kind as u8);
    // NOTE: encoding into a BytesMut can't run out of capacity.
    let _ = msg.encode(&mut buf);
    buf.freeze()
}

/// Prefix raw user bytes with the user message tag.
pub fn user_frame(raw: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + raw.len());
    buf.put_u8(MessageType::User as u8);
    buf.put_slice(raw);
    buf.freeze()
}

/// Concatenate multiple frames into a single compound frame.
///
/// Frames longer than `u16::MAX` bytes, and any frames past the first `u16::MAX`, are
/// left out. Callers bound both by the packet budget.
pub fn make_compound(msgs: &[Bytes]) -> Bytes {
    let max = u16::MAX as usize;
    let msgs: Vec<&Bytes> = msgs.iter().filter(|m| m.len() <= max).take(max).collect();

    let body: usize = msgs.iter().map(|m| m.len()).sum();
    let mut buf = BytesMut::with_capacity(COMPOUND_HEADER_OVERHEAD + 2 * msgs.len() + body);

    buf.put_u8(MessageType::Compound as u8);
    buf.put_u16(msgs.len() as u16);
    for m in msgs.iter() {
        buf.put_u16(m.len() as u16);
    }
    for m in msgs {
        buf.put_slice(m);
    }

    buf.freeze()
}

/// Split the body of a compound frame (after the tag) into its parts.
///
/// Returns the number of parts that were declared but didn't fit in the buffer, along
/// with every part that did.
pub fn split_compound(mut buf: Bytes) -> Result<(usize, Vec<Bytes>), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    let count = buf.get_u16() as usize;

    if buf.len() < count * 2 {
        return Err(DecodeError::Truncated);
    }
    let lens: Vec<usize> = (0..count).map(|_| buf.get_u16() as usize).collect();

    let mut parts = Vec::with_capacity(count);
    for (i, len) in lens.iter().copied().enumerate() {
        if buf.len() < len {
            return Ok((count - i, parts));
        }
        parts.push(buf.split_to(len));
    }

    Ok((0, parts))
}

/// Wrap a frame with the compression layer.
pub fn compress(frame: &[u8]) -> io::Result<Bytes> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(frame.len() / 2 + 2), Compression::fast());
    enc.get_mut().push(MessageType::Compress as u8);
    enc.get_mut().push(ZLIB);
    enc.write_all(frame)?;
    enc.finish().map(Bytes::from)
}

/// Remove the compression layer from the body of a compress frame (after the tag).
pub fn decompress(buf: &[u8]) -> Result<Bytes, DecodeError> {
    let (&algo, body) = buf.split_first().ok_or(DecodeError::Truncated)?;
    if algo != ZLIB {
        return Err(DecodeError::UnknownCompression(algo));
    }

    let mut out = Vec::with_capacity(body.len() * 2);
    ZlibDecoder::new(body)
        .take(MAX_DECOMPRESSED + 1)
        .read_to_end(&mut out)
        .map_err(DecodeError::Decompress)?;

    if out.len() as u64 > MAX_DECOMPRESSED {
        return Err(DecodeError::TooLarge);
    }

    Ok(out.into())
}

/// Flatten compressed and compound layers, yielding every message frame contained in
/// `frame`. Encryption must already have been removed.
///
/// Parts that fail to unwrap are returned as errors in place, so a single bad part
/// doesn't take the rest of the packet with it.
pub fn unwrap_frames(frame: Bytes) -> Vec<Result<Bytes, DecodeError>> {
    let mut out = Vec::new();
    unwrap_into(frame, &mut out, 0);
    out
}

fn unwrap_into(mut frame: Bytes, out: &mut Vec<Result<Bytes, DecodeError>>, depth: usize) {
    // nesting isn't produced by any sender; bound it to keep hostile input cheap.
    const MAX_DEPTH: usize = 4;

    let kind = match peek_type(&frame) {
        Ok(kind) => kind,
        Err(e) => return out.push(Err(e)),
    };

    match kind {
        MessageType::Compound | MessageType::Compress if depth >= MAX_DEPTH => {
            out.push(Err(DecodeError::Unexpected(kind)));
        }

        MessageType::Compound => match split_compound(frame.split_off(1)) {
            Ok((truncated, parts)) => {
                for part in parts {
                    unwrap_into(part, out, depth + 1);
                }
                if truncated > 0 {
                    out.push(Err(DecodeError::Truncated));
                }
            }
            Err(e) => out.push(Err(e)),
        },

        MessageType::Compress => match decompress(&frame[1..]) {
            Ok(inner) => unwrap_into(inner, out, depth + 1),
            Err(e) => out.push(Err(e)),
        },

        _ => out.push(Ok(frame)),
    }
}

/// Encode a push/pull frame.
pub fn encode_push_pull(join: bool, nodes: &[PushNodeState], user_state: &[u8]) -> Bytes {
    let header = PushPullHeader {
        nodes: nodes.len() as u32,
        user_state_len: user_state.len() as u32,
        join,
    };

    let body: usize = nodes.iter().map(|n| n.encoded_len() + 5).sum();
    let mut buf = BytesMut::with_capacity(1 + 16 + body + user_state.len());

    buf.put_u8(MessageType::PushPull as u8);
    let _ = header.encode_length_delimited(&mut buf);
    for node in nodes {
        let _ = node.encode_length_delimited(&mut buf);
    }
    buf.put_slice(user_state);

    buf.freeze()
}

/// A decoded push/pull frame.
#[derive(Clone, Debug, PartialEq)]
pub struct PushPull {
    pub join: bool,
    pub nodes: Vec<PushNodeState>,
    pub user_state: Bytes,
}

/// Decode a push/pull frame (including its tag).
pub fn decode_push_pull(mut buf: Bytes) -> Result<PushPull, DecodeError> {
    match peek_type(&buf)? {
        MessageType::PushPull => buf.advance(1),
        kind => return Err(DecodeError::Unexpected(kind)),
    }

    let header = PushPullHeader::decode_length_delimited(&mut buf)?;

    // NOTE: cap the preallocation; the count is untrusted.
    let mut nodes = Vec::with_capacity((header.nodes as usize).min(1024));
    for _ in 0..header.nodes {
        nodes.push(PushNodeState::decode_length_delimited(&mut buf)?);
    }

    let user_len = header.user_state_len as usize;
    if buf.len() < user_len {
        return Err(DecodeError::Truncated);
    }

    Ok(PushPull {
        join: header.join,
        nodes,
        user_state: buf.split_to(user_len),
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum SocketAddrError {
    #[error("missing address")]
    Missing,
    #[error("invalid host len: {}", .0)]
    InvalidLen(usize),
    #[error("invalid port: {}", .0)]
    InvalidPort(u32),
}

impl TryFrom<&Endpoint> for SocketAddr {
    type Error = SocketAddrError;

    fn try_from(Endpoint { host, port }: &Endpoint) -> Result<Self, Self::Error> {
        let port: u16 = (*port)
            .try_into()
            .map_err(|_| SocketAddrError::InvalidPort(*port))?;

        let ip = if let Ok(v4) = <[u8; 4]>::try_from(host.as_slice()) {
            IpAddr::from(v4)
        } else if let Ok(v6) = <[u8; 16]>::try_from(host.as_slice()) {
            IpAddr::from(v6)
        } else {
            return Err(SocketAddrError::InvalidLen(host.len()));
        };

        Ok(SocketAddr::new(ip, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr {
            SocketAddr::V4(s) => s.ip().octets().to_vec(),
            SocketAddr::V6(s) => s.ip().octets().to_vec(),
        };

        Self {
            host,
            port: addr.port() as u32,
        }
    }
}

/// Resolve an optional wire address.
pub fn socket_addr(e: &Option<Endpoint>) -> Result<SocketAddr, DecodeError> {
    let e = e.as_ref().ok_or(SocketAddrError::Missing)?;
    Ok(SocketAddr::try_from(e)?)
}
