//! Service event envelope
//!
//! Every message in a service mailbox carries a 12-byte header:
//!
//! ```text
//! +-----------+-----------+------+--------------------+
//! | source_id |   token   | kind |   payload length   |
//! |  32 bits  |  32 bits  | 8bit |      24 bits       |
//! +-----------+-----------+------+--------------------+
//! ```
//!
//! The kind byte holds the event type in its high nibble, the `MOVEBUF`
//! flag in bit 3 and, for `MSG`, the message subkind in bits 0-2.

use std::sync::Arc;

use crate::channel::Connection;
use crate::timer_watcher::TimerWatcher;

/// Payload buffer was moved in rather than copied
pub const EVENT_MOVEBUF: u8 = 0x08;
pub const EVENT_TYPE_MASK: u8 = 0xF0;
pub const EVENT_MSG_MASK: u8 = 0x07;

pub const EVENT_MSG: u8 = 0x10;
pub const EVENT_RUN_AFTER: u8 = 0x20;
pub const EVENT_RUN_EVERY: u8 = 0x30;
pub const EVENT_YIELD: u8 = 0x40;
pub const EVENT_ACCEPT: u8 = 0x50;
pub const EVENT_CONNECT: u8 = 0x60;
pub const EVENT_DNS: u8 = 0x70;
pub const EVENT_BINARY: u8 = 0x80;
pub const EVENT_SEND_OK: u8 = 0x90;
pub const EVENT_DISCONNECT: u8 = 0xA0;
pub const EVENT_COMMAND: u8 = 0xB0;
pub const EVENT_SERVICE_STOP: u8 = 0xC0;

pub const MSG_REPLY: u8 = 1;
pub const MSG_CALL: u8 = 2;
pub const MSG_SEND: u8 = 3;
pub const MSG_TEXT: u8 = 4;
pub const MSG_PING: u8 = 5;
pub const MSG_PONG: u8 = 6;
pub const MSG_CLOSE: u8 = 7;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD: usize = 0x00FF_FFFF;

const LENGTH_MASK: u32 = 0x00FF_FFFF;
const KIND_SHIFT: u32 = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    pub source_id: u32,
    pub token: u32,
    pub length: u32,
}

impl EventHeader {
    pub const SIZE: usize = 12;

    /// `payload_len` is truncated to 24 bits; callers check `MAX_PAYLOAD`.
    pub fn new(kind: u8, source_id: u32, token: u32, payload_len: usize) -> Self {
        Self {
            source_id,
            token,
            length: ((kind as u32) << KIND_SHIFT) | (payload_len as u32 & LENGTH_MASK),
        }
    }

    /// Full kind byte, flags included
    #[inline]
    pub fn kind(&self) -> u8 {
        (self.length >> KIND_SHIFT) as u8
    }

    #[inline]
    pub fn event_type(&self) -> u8 {
        self.kind() & EVENT_TYPE_MASK
    }

    #[inline]
    pub fn msg_kind(&self) -> u8 {
        self.kind() & EVENT_MSG_MASK
    }

    #[inline]
    pub fn is_move_buf(&self) -> bool {
        self.kind() & EVENT_MOVEBUF != 0
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.length & LENGTH_MASK) as usize
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.source_id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.token.to_ne_bytes());
        out[8..12].copy_from_slice(&self.length.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            source_id: word(0),
            token: word(4),
            length: word(8),
        }
    }
}

pub enum Payload {
    Empty,
    Inline(Box<[u8]>),
    Moved(Vec<u8>),
    Timer(Arc<TimerWatcher>),
    Connection {
        conn: Arc<dyn Connection>,
        extra: Box<[u8]>,
    },
}

impl Payload {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Inline(b) => &b[..],
            Payload::Moved(v) => v.as_slice(),
            Payload::Connection { extra, .. } => &extra[..],
            Payload::Empty | Payload::Timer(_) => &[],
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Empty => write!(f, "Empty"),
            Payload::Inline(b) => write!(f, "Inline({} bytes)", b.len()),
            Payload::Moved(v) => write!(f, "Moved({} bytes)", v.len()),
            Payload::Timer(_) => write!(f, "Timer"),
            Payload::Connection { extra, .. } => write!(f, "Connection(+{} bytes)", extra.len()),
        }
    }
}

#[derive(Debug)]
pub struct ServiceEvent {
    pub header: EventHeader,
    pub payload: Payload,
}

impl ServiceEvent {
    /// Copy `data` into the event
    pub fn message(kind: u8, source_id: u32, token: u32, data: &[u8]) -> Self {
        let payload = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Inline(data.into())
        };
        Self {
            header: EventHeader::new(kind & !EVENT_MOVEBUF, source_id, token, data.len()),
            payload,
        }
    }

    /// Take ownership of `buf`; sets `MOVEBUF`
    pub fn moved(kind: u8, source_id: u32, token: u32, buf: Vec<u8>) -> Self {
        Self {
            header: EventHeader::new(kind | EVENT_MOVEBUF, source_id, token, buf.len()),
            payload: Payload::Moved(buf),
        }
    }

    /// Header only
    pub fn signal(kind: u8, source_id: u32, token: u32) -> Self {
        Self {
            header: EventHeader::new(kind, source_id, token, 0),
            payload: Payload::Empty,
        }
    }

    pub fn timer(kind: u8, source_id: u32, token: u32, watcher: Arc<TimerWatcher>) -> Self {
        Self {
            header: EventHeader::new(kind, source_id, token, 0),
            payload: Payload::Timer(watcher),
        }
    }

    /// ACCEPT / CONNECT carrying a new connection and optional extra bytes
    pub fn connection(kind: u8, token: u32, conn: Arc<dyn Connection>, extra: &[u8]) -> Self {
        Self {
            header: EventHeader::new(kind, 0, token, extra.len()),
            payload: Payload::Connection {
                conn,
                extra: extra.into(),
            },
        }
    }

    #[inline]
    pub fn kind(&self) -> u8 {
        self.header.kind()
    }

    pub fn bytes(&self) -> &[u8] {
        self.payload.bytes()
    }
}

/// What a handler sees for one event
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// Event type, or `EVENT_MSG | subkind` for messages; never has `MOVEBUF`
    pub kind: u8,
    pub source_id: u32,
    pub token: u32,
    pub payload: &'a [u8],
}

impl<'a> Delivery<'a> {
    pub fn event_type(&self) -> u8 {
        self.kind & EVENT_TYPE_MASK
    }

    pub fn is_msg(&self, subkind: u8) -> bool {
        self.kind == EVENT_MSG | subkind
    }
}
