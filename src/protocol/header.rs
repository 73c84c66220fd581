use std::io;

use thiserror::Error;

use crate::message::{Message, MessagePool};

use super::control::ControlCode;

pub const MAGIC: [u8; 3] = *b"SAG";
/// Version byte sent on every frame.
pub const VERSION: u8 = b'5';
/// Frames with a version byte at or above this are rejected.
pub const VERSION_LIMIT: u8 = 0x36;

/// Length, magic, header length, TTL and priority.
pub const PREFIX_LENGTH: usize = 12;
pub const MIN_FRAME_LENGTH: usize = PREFIX_LENGTH;
pub const BASE_HEADER_LENGTH: usize = 20;
pub const ROUTED_HEADER_LENGTH: usize = 28;

/// Leading body bytes of a peer-driver health frame.
pub const HEALTH_MARKER: [u8; 2] = *b"HB";

pub(crate) const TOTAL_LENGTH: usize = 0;
pub(crate) const MAGIC_AT: usize = 4;
pub(crate) const VERSION_AT: usize = 7;
pub(crate) const HEADER_LENGTH: usize = 8;
pub(crate) const TTL: usize = 10;
pub(crate) const PRIORITY: usize = 11;
pub(crate) const TARGET: usize = 12;
pub(crate) const SEQUENCE: usize = 16;
pub(crate) const ROUTE: usize = 20;
pub(crate) const TIMEOUT: usize = 24;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {length} outside 12..={max} (received {captured:02x?})")]
    Length {
        length: usize,
        max: usize,
        captured: Vec<u8>,
    },
    #[error("bad frame magic (received {captured:02x?})")]
    Magic { captured: Vec<u8> },
    #[error("unsupported protocol version 0x{0:02x}")]
    Version(u8),
    #[error("header length {header} does not fit a frame of {total} bytes")]
    HeaderLength { header: usize, total: usize },
    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Decoded fixed header of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub total_length: u32,
    pub version: u8,
    pub header_length: u16,
    pub ttl: u8,
    pub priority: u8,
    pub target: i32,
    pub sequence: u32,
    pub route: u32,
    pub timeout: u32,
}

impl Header {
    /// Builds the header a message is sent with. The route and timeout
    /// fields are only present when the message carries a route.
    pub fn of(message: &Message) -> Self {
        let header_length = if message.route() != 0 {
            ROUTED_HEADER_LENGTH
        } else {
            BASE_HEADER_LENGTH
        };
        Self {
            total_length: (header_length + message.len()) as u32,
            version: VERSION,
            header_length: header_length as u16,
            ttl: message.ttl(),
            priority: message.priority(),
            target: message.target(),
            sequence: 0,
            route: message.route(),
            timeout: message.timeout(),
        }
    }

    pub fn body_length(&self) -> usize {
        self.total_length as usize - self.header_length as usize
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_length.to_be_bytes());
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        out.extend_from_slice(&self.header_length.to_be_bytes());
        out.push(self.ttl);
        out.push(self.priority);
        out.extend_from_slice(&self.target.to_be_bytes());
        // Peers using the sequence field for stream sync expect zero.
        out.extend_from_slice(&0u32.to_be_bytes());
        if self.header_length as usize > BASE_HEADER_LENGTH {
            out.extend_from_slice(&self.route.to_be_bytes());
        }
        if self.header_length as usize > TIMEOUT {
            out.extend_from_slice(&self.timeout.to_be_bytes());
        }
    }

    /// Validates the fixed prefix of a frame and returns its total length.
    pub fn check_prefix(prefix: &[u8], max: usize) -> Result<usize, FrameError> {
        if prefix.len() < PREFIX_LENGTH {
            return Err(FrameError::Length {
                length: prefix.len(),
                max,
                captured: prefix.to_vec(),
            });
        }

        let total = be_u32(prefix, TOTAL_LENGTH) as usize;
        if !(MIN_FRAME_LENGTH..=max).contains(&total) {
            return Err(FrameError::Length {
                length: total,
                max,
                captured: prefix[..PREFIX_LENGTH].to_vec(),
            });
        }
        if prefix[MAGIC_AT..VERSION_AT] != MAGIC {
            return Err(FrameError::Magic {
                captured: prefix[..PREFIX_LENGTH].to_vec(),
            });
        }
        if prefix[VERSION_AT] >= VERSION_LIMIT {
            return Err(FrameError::Version(prefix[VERSION_AT]));
        }
        Ok(total)
    }

    pub fn parse(frame: &[u8], max: usize) -> Result<Self, FrameError> {
        let total = Self::check_prefix(frame, max)?;
        if frame.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                got: frame.len(),
            });
        }

        let header_length = u16::from_be_bytes([frame[HEADER_LENGTH], frame[HEADER_LENGTH + 1]]);
        let hl = header_length as usize;
        if hl < BASE_HEADER_LENGTH || hl > total {
            return Err(FrameError::HeaderLength {
                header: hl,
                total,
            });
        }

        Ok(Self {
            total_length: total as u32,
            version: frame[VERSION_AT],
            header_length,
            ttl: frame[TTL],
            priority: frame[PRIORITY],
            target: be_u32(frame, TARGET) as i32,
            sequence: be_u32(frame, SEQUENCE),
            route: if hl >= ROUTE + 4 {
                be_u32(frame, ROUTE)
            } else {
                0
            },
            timeout: if hl >= TIMEOUT + 4 {
                be_u32(frame, TIMEOUT)
            } else {
                0
            },
        })
    }

    fn apply(&self, message: &mut Message) {
        // Routed frames and frames for a service are payload, whatever they
        // start with.
        let health = self.route == 0
            && self.target <= 0
            && message.body().starts_with(&HEALTH_MARKER);
        message.set_target(if health {
            ControlCode::Health.code()
        } else {
            self.target
        });
        message.set_header_length(self.header_length);
        message.set_ttl(self.ttl);
        message.set_priority(self.priority);
        message.set_sequence(self.sequence);
        message.set_route(self.route);
        message.set_timeout(self.timeout);
    }
}

/// Serializes a message into a complete frame.
pub fn encode(message: &Message) -> Vec<u8> {
    let header = Header::of(message);
    let mut out = Vec::with_capacity(header.total_length as usize);
    header.write(&mut out);
    out.extend_from_slice(message.body());
    out
}

/// Decodes a complete frame into a message allocated from `pool`.
pub fn decode(frame: &[u8], pool: &MessagePool, max: usize) -> Result<Message, FrameError> {
    let header = Header::parse(frame, max)?;
    let start = header.header_length as usize;
    let body = &frame[start..header.total_length as usize];

    let mut message = pool.allocate(body.len());
    message.body_mut().copy_from_slice(body);
    header.apply(&mut message);
    Ok(message)
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
