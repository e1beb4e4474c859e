//! Binary layouts exchanged between processes.
//!
//! Everything here is network byte order. Variable-length strings are
//! carried as a `u16` length followed by UTF-8 bytes.
//!
//! Three families of layouts live here:
//!
//! - the raw handshake a process performs with the Coordinator to obtain
//!   its range ([`LocateCoordRequest`], [`LocateCoordReply`], [`ConnectAck`]),
//! - the frame used by the local-socket transport to carry one message
//!   ([`encode_frame`], [`decode_frame_body`]),
//! - the payloads of the ITC messages exchanged with the Coordinator's name
//!   server and with a gateway ([`MailboxNotice`], [`LocateRequest`],
//!   [`LocateReply`], [`GatewayLocateRequest`], [`GatewayLocateReply`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::mbox_id::MailboxId;
use crate::message::{Message, MessageHeader, HEADER_SIZE, SENTINEL};

/// Handshake: process asks the Coordinator for a range.
pub const LOCATE_COORD_REQUEST: u32 = 0x4C43_5251;
/// Handshake: Coordinator answers with a range.
pub const LOCATE_COORD_REPLY: u32 = 0x4C43_5250;
/// Handshake: Coordinator confirms the per-process channel.
pub const CONNECT_ACK: u32 = 0x4C43_4143;
/// `my_range` value meaning the Coordinator is out of process slots.
pub const NO_SLOT: u32 = 0xFFFF_FFFF;

/// A mailbox was created; payload is a [`MailboxNotice`].
pub const ADD_MAILBOX: u32 = 0xF1C0_0001;
/// A mailbox was deleted; payload is a [`MailboxNotice`].
pub const RMV_MAILBOX: u32 = 0xF1C0_0002;
/// Locate-by-name query; payload is a [`LocateRequest`].
pub const LOCATE_REQUEST: u32 = 0xF1C0_0003;
/// Locate-by-name answer; payload is a [`LocateReply`].
pub const LOCATE_REPLY: u32 = 0xF1C0_0004;
/// Coordinator to gateway; payload is a [`GatewayLocateRequest`].
pub const GW_LOCATE_REQUEST: u32 = 0xF1C0_0005;
/// Gateway to Coordinator; payload is a [`GatewayLocateReply`].
pub const GW_LOCATE_REPLY: u32 = 0xF1C0_0006;

/// Largest payload the local-socket transport carries.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Largest frame body: header, payload and sentinel.
pub const MAX_FRAME_BODY: usize = HEADER_SIZE + MAX_FRAME_PAYLOAD + 1;

/// Errors decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("unexpected kind {0:#010x}")]
    UnexpectedKind(u32),

    #[error("bad sentinel byte {0:#04x}")]
    BadSentinel(u8),

    #[error("frame body of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("frame body is {actual} bytes, header says {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("string field of {0} bytes is too long")]
    StringTooLong(usize),
}

fn need(buf: &[u8], n: usize, what: &'static str) -> Result<(), WireError> {
    if buf.len() < n {
        return Err(WireError::Truncated {
            what,
            need: n,
            have: buf.len(),
        });
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), WireError> {
    let len = u16::try_from(s.len()).map_err(|_| WireError::StringTooLong(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], what: &'static str) -> Result<String, WireError> {
    need(buf, 2, what)?;
    let len = buf.get_u16() as usize;
    need(buf, len, what)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn expect_kind(buf: &mut &[u8], kind: u32, what: &'static str) -> Result<(), WireError> {
    need(buf, 4, what)?;
    match buf.get_u32() {
        k if k == kind => Ok(()),
        other => Err(WireError::UnexpectedKind(other)),
    }
}

// ---------------------------------------------------------------------------
// Coordinator handshake
// ---------------------------------------------------------------------------

/// First bytes a process writes to the Coordinator's well-known socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateCoordRequest {
    /// OS process id of the requester.
    pub pid: u32,
}

impl LocateCoordRequest {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(LOCATE_COORD_REQUEST);
        buf.put_u32(self.pid);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        expect_kind(&mut buf, LOCATE_COORD_REQUEST, "locate-coordinator request")?;
        need(buf, 4, "locate-coordinator request")?;
        Ok(Self { pid: buf.get_u32() })
    }
}

/// The Coordinator's answer to [`LocateCoordRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateCoordReply {
    /// Range assigned to the requester, or [`NO_SLOT`].
    pub my_range: u32,
    pub coord_mask: u32,
    /// The Coordinator's name-server mailbox.
    pub coord_id: MailboxId,
}

impl LocateCoordReply {
    pub const SIZE: usize = 16;

    pub fn no_slot(coord_mask: u32, coord_id: MailboxId) -> Self {
        Self {
            my_range: NO_SLOT,
            coord_mask,
            coord_id,
        }
    }

    pub fn is_no_slot(&self) -> bool {
        self.my_range == NO_SLOT
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u32(LOCATE_COORD_REPLY);
        buf.put_u32(self.my_range);
        buf.put_u32(self.coord_mask);
        buf.put_u32(self.coord_id.as_raw());
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        expect_kind(&mut buf, LOCATE_COORD_REPLY, "locate-coordinator reply")?;
        need(buf, 12, "locate-coordinator reply")?;
        Ok(Self {
            my_range: buf.get_u32(),
            coord_mask: buf.get_u32(),
            coord_id: MailboxId::from_raw(buf.get_u32()),
        })
    }
}

/// Sent by the Coordinator once the per-process channel is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck;

impl ConnectAck {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        CONNECT_ACK.to_be_bytes()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        expect_kind(&mut buf, CONNECT_ACK, "connect ack")?;
        Ok(Self)
    }
}

// ---------------------------------------------------------------------------
// Local-socket frames
// ---------------------------------------------------------------------------

/// Encode a message as a length-prefixed frame.
///
/// ```text
/// [len:u32][flags:u32][receiver:u32][sender:u32][kind:u32][size:u32][payload][sentinel:u8]
/// ```
/// `len` counts everything after itself.
pub fn encode_frame(message: &Message) -> Bytes {
    let header = message.header();
    let payload = message.payload();
    let body_len = HEADER_SIZE + payload.len() + 1;

    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u32(header.flags);
    buf.put_u32(header.receiver.as_raw());
    buf.put_u32(header.sender.as_raw());
    buf.put_u32(header.kind);
    buf.put_u32(header.size);
    buf.put_slice(payload);
    buf.put_u8(message.sentinel());
    buf.freeze()
}

/// A decoded frame body borrowing the payload from the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameBody<'a> {
    pub header: MessageHeader,
    pub payload: &'a [u8],
}

/// Check a frame length prefix before reading the body.
pub fn check_frame_len(len: u32) -> Result<usize, WireError> {
    let len = len as usize;
    if len > MAX_FRAME_BODY {
        return Err(WireError::TooLarge(len));
    }
    if len < HEADER_SIZE + 1 {
        return Err(WireError::Truncated {
            what: "frame",
            need: HEADER_SIZE + 1,
            have: len,
        });
    }
    Ok(len)
}

/// Decode the body of a frame (everything after the length prefix).
pub fn decode_frame_body(body: &[u8]) -> Result<FrameBody<'_>, WireError> {
    let mut buf = body;
    need(buf, HEADER_SIZE + 1, "frame")?;

    let header = MessageHeader {
        flags: buf.get_u32(),
        receiver: MailboxId::from_raw(buf.get_u32()),
        sender: MailboxId::from_raw(buf.get_u32()),
        kind: buf.get_u32(),
        size: buf.get_u32(),
    };

    let size = header.size as usize;
    let expected = HEADER_SIZE + size + 1;
    if body.len() != expected {
        return Err(WireError::LengthMismatch {
            expected,
            actual: body.len(),
        });
    }

    let sentinel = body[HEADER_SIZE + size];
    if sentinel != SENTINEL {
        return Err(WireError::BadSentinel(sentinel));
    }

    Ok(FrameBody {
        header,
        payload: &body[HEADER_SIZE..HEADER_SIZE + size],
    })
}

// ---------------------------------------------------------------------------
// Name-server payloads
// ---------------------------------------------------------------------------

/// Payload of [`ADD_MAILBOX`] and [`RMV_MAILBOX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxNotice {
    pub mbox_id: MailboxId,
    pub name: String,
}

impl MailboxNotice {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(6 + self.name.len());
        buf.put_u32(self.mbox_id.as_raw());
        put_str(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 4, "mailbox notice")?;
        let mbox_id = MailboxId::from_raw(buf.get_u32());
        let name = get_str(&mut buf, "mailbox notice")?;
        Ok(Self { mbox_id, name })
    }
}

/// Payload of [`LOCATE_REQUEST`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateRequest {
    /// Mailbox the reply goes to.
    pub requester: MailboxId,
    pub timeout_ms: u32,
    /// Do not ask the gateway when the name is unknown locally.
    pub internal_only: bool,
    pub name: String,
}

impl LocateRequest {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(11 + self.name.len());
        buf.put_u32(self.requester.as_raw());
        buf.put_u32(self.timeout_ms);
        buf.put_u8(u8::from(self.internal_only));
        put_str(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 9, "locate request")?;
        let requester = MailboxId::from_raw(buf.get_u32());
        let timeout_ms = buf.get_u32();
        let internal_only = buf.get_u8() != 0;
        let name = get_str(&mut buf, "locate request")?;
        Ok(Self {
            requester,
            timeout_ms,
            internal_only,
            name,
        })
    }
}

/// Payload of [`LOCATE_REPLY`]. `mbox_id` is [`MailboxId::NONE`] when the
/// name was not found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateReply {
    pub mbox_id: MailboxId,
    /// OS process id of the owner, 0 when unknown.
    pub pid: u32,
    /// Resolved through the gateway on another host.
    pub external: bool,
    pub namespace: String,
    /// The name that was looked up.
    pub name: String,
}

impl LocateReply {
    pub fn not_found(name: &str) -> Self {
        Self {
            mbox_id: MailboxId::NONE,
            pid: 0,
            external: false,
            namespace: String::new(),
            name: name.to_string(),
        }
    }

    pub fn is_found(&self) -> bool {
        !self.mbox_id.is_none()
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(13 + self.namespace.len() + self.name.len());
        buf.put_u32(self.mbox_id.as_raw());
        buf.put_u32(self.pid);
        buf.put_u8(u8::from(self.external));
        put_str(&mut buf, &self.namespace)?;
        put_str(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 9, "locate reply")?;
        let mbox_id = MailboxId::from_raw(buf.get_u32());
        let pid = buf.get_u32();
        let external = buf.get_u8() != 0;
        let namespace = get_str(&mut buf, "locate reply")?;
        let name = get_str(&mut buf, "locate reply")?;
        Ok(Self {
            mbox_id,
            pid,
            external,
            namespace,
            name,
        })
    }
}

/// Payload of [`GW_LOCATE_REQUEST`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLocateRequest {
    /// Correlates the gateway's reply with the waiting requester.
    pub tag: u32,
    pub timeout_ms: u32,
    pub name: String,
}

impl GatewayLocateRequest {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(10 + self.name.len());
        buf.put_u32(self.tag);
        buf.put_u32(self.timeout_ms);
        put_str(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 8, "gateway locate request")?;
        let tag = buf.get_u32();
        let timeout_ms = buf.get_u32();
        let name = get_str(&mut buf, "gateway locate request")?;
        Ok(Self {
            tag,
            timeout_ms,
            name,
        })
    }
}

/// Payload of [`GW_LOCATE_REPLY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayLocateReply {
    pub tag: u32,
    pub mbox_id: MailboxId,
    /// Namespace of the host that owns the mailbox.
    pub namespace: String,
}

impl GatewayLocateReply {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(10 + self.namespace.len());
        buf.put_u32(self.tag);
        buf.put_u32(self.mbox_id.as_raw());
        put_str(&mut buf, &self.namespace)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        need(buf, 8, "gateway locate reply")?;
        let tag = buf.get_u32();
        let mbox_id = MailboxId::from_raw(buf.get_u32());
        let namespace = get_str(&mut buf, "gateway locate reply")?;
        Ok(Self {
            tag,
            mbox_id,
            namespace,
        })
    }
}
