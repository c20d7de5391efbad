//! Channel framing
//!
//! A codec sits between a channel and its connection: inbound bytes are
//! cut into frames and pushed into the bound service, outbound payloads
//! are framed before they reach the connection.

use svcio_core::kwarn;

use crate::channel::{Channel, Connection};
use crate::event::EVENT_BINARY;

pub trait Codec: Send + Sync {
    /// Consume complete frames from the front of `buf`. Returning false
    /// tells the backend to drop the connection.
    fn receive(&self, channel: &Channel, buf: &mut Vec<u8>) -> bool;

    fn write(&self, conn: &dyn Connection, data: &[u8], kind: u8, token: u32) -> bool;

    fn write_move(&self, conn: &dyn Connection, data: Vec<u8>, kind: u8, token: u32) -> bool;
}

const PREFIX_LEN: usize = 4;

/// Frames of `u32` big-endian length followed by that many bytes
#[derive(Debug, Clone)]
pub struct LengthPrefixed {
    max_frame: usize,
    kind: u8,
}

impl LengthPrefixed {
    pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024 - 1;

    pub fn new() -> Self {
        Self {
            max_frame: Self::DEFAULT_MAX_FRAME,
            kind: EVENT_BINARY,
        }
    }

    /// Frames above `max` are a protocol error
    pub fn max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }

    /// Event kind each inbound frame is delivered as
    pub fn event_kind(mut self, kind: u8) -> Self {
        self.kind = kind;
        self
    }

    pub fn encode(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() > self.max_frame || data.len() > u32::MAX as usize {
            return None;
        }
        let mut out = Vec::with_capacity(PREFIX_LEN + data.len());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
        Some(out)
    }

    /// Split off the next complete frame. `Err(())` for an oversized frame.
    pub fn decode(&self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, ()> {
        if buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame {
            return Err(());
        }
        if buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let frame = buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
        buf.drain(..PREFIX_LEN + len);
        Ok(Some(frame))
    }
}

impl Default for LengthPrefixed {
    fn default() -> Self {
        Self::new()
    }
}

fn completion(token: u32) -> Option<u32> {
    (token != 0).then_some(token)
}

impl Codec for LengthPrefixed {
    fn receive(&self, channel: &Channel, buf: &mut Vec<u8>) -> bool {
        loop {
            match self.decode(buf) {
                Ok(Some(frame)) => {
                    if !channel.push_service_move(frame, self.kind, 0) {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(()) => {
                    kwarn!("channel {:#x}: oversized frame", channel.id());
                    return false;
                }
            }
        }
    }

    fn write(&self, conn: &dyn Connection, data: &[u8], _kind: u8, token: u32) -> bool {
        match self.encode(data) {
            Some(framed) => conn.send(framed, completion(token)),
            None => false,
        }
    }

    fn write_move(&self, conn: &dyn Connection, data: Vec<u8>, kind: u8, token: u32) -> bool {
        self.write(conn, &data, kind, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_wait_for_more() {
        let codec = LengthPrefixed::new();
        let mut buf = vec![0, 0, 0];
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(&[5, b'h', b'e']);
        assert_eq!(codec.decode(&mut buf), Ok(None));
        buf.extend_from_slice(b"llo");
        assert_eq!(codec.decode(&mut buf), Ok(Some(b"hello".to_vec())));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = LengthPrefixed::new();
        let mut buf = codec.encode(b"ab").unwrap();
        buf.extend(codec.encode(b"").unwrap());
        buf.extend(codec.encode(b"xyz").unwrap());
        buf.push(0);

        assert_eq!(codec.decode(&mut buf), Ok(Some(b"ab".to_vec())));
        assert_eq!(codec.decode(&mut buf), Ok(Some(Vec::new())));
        assert_eq!(codec.decode(&mut buf), Ok(Some(b"xyz".to_vec())));
        assert_eq!(codec.decode(&mut buf), Ok(None));
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let codec = LengthPrefixed::new().max_frame(4);
        assert!(codec.encode(b"12345").is_none());
        let mut buf = vec![0, 0, 0, 9, 1];
        assert_eq!(codec.decode(&mut buf), Err(()));
    }

    #[test]
    fn test_prefix_is_big_endian() {
        let framed = LengthPrefixed::new().encode(&[7u8; 258]).unwrap();
        assert_eq!(&framed[..4], &[0, 0, 1, 2]);
        assert_eq!(framed.len(), 262);
    }
}
