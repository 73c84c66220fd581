//! Pooled message buffers.
//!
//! A [`Message`] owns a byte body plus the header metadata that travels with it
//! on the wire (target, route, TTL, priority, timeout). Messages are handed out
//! by a [`MessagePool`] and must be given back exactly once through
//! [`MessagePool::free`]; whichever layer currently holds a message owns it.
//!
//! # Capacity
//!
//! Body capacity is always a multiple of [`BLOCK_SIZE`]. Requests are rounded up,
//! and the pool reuses the first free buffer large enough for a request.
//!
//! # Cursor
//!
//! Every message carries a read/write cursor so a producer can append fields
//! and a consumer can walk a received body sequentially:
//!
//! ```rust
//! use tether::message::MessagePool;
//!
//! let pool = MessagePool::new();
//! let mut msg = pool.allocate(0);
//! msg.put_u32(7);
//! msg.put_u16_rev(0x0102);
//!
//! msg.reset();
//! assert_eq!(msg.get_u32().unwrap(), 7);
//! assert_eq!(msg.get_u16_rev().unwrap(), 0x0102);
//! assert_eq!(msg.length_left(), 0);
//! pool.free(msg).unwrap();
//! ```
mod pool;

use thiserror::Error;

use crate::operation::OperationId;

pub use pool::{MessagePool, PoolError, PoolStats};

/// Allocation granularity of message bodies.
pub const BLOCK_SIZE: usize = 1024;

/// Rounds a body length up to the next [`BLOCK_SIZE`] boundary.
pub fn round_capacity(len: usize) -> usize {
    len.max(1).div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("read of {wanted} bytes with only {left} left in body")]
    Underflow { wanted: usize, left: usize },
}

#[derive(Debug)]
pub struct Message {
    serial: u64,
    body: Vec<u8>,
    length: usize,
    header_length: u16,
    target: i32,
    route: u32,
    timeout: u32,
    ttl: u8,
    priority: u8,
    sequence: u32,
    cursor: usize,
    token: u64,
    pub(crate) operation: Option<OperationId>,
}

impl Message {
    pub(crate) fn new(serial: u64, len: usize) -> Self {
        Self {
            serial,
            body: vec![0; round_capacity(len)],
            length: len,
            header_length: 0,
            target: 0,
            route: 0,
            timeout: 0,
            ttl: 0,
            priority: 0,
            sequence: 0,
            cursor: 0,
            token: 0,
            operation: None,
        }
    }

    /// Prepares a buffer taken off the free list for a new owner.
    pub(crate) fn recycle(&mut self, len: usize) {
        self.body.fill(0);
        self.length = len;
        self.header_length = 0;
        self.target = 0;
        self.route = 0;
        self.timeout = 0;
        self.ttl = 0;
        self.priority = 0;
        self.sequence = 0;
        self.cursor = 0;
        self.token = 0;
        self.operation = None;
    }

    /// Clears the fields that tie a buffer to its last owner.
    pub(crate) fn release(&mut self) {
        self.operation = None;
        self.token = 0;
        self.route = 0;
        self.target = 0;
    }

    pub(crate) fn copy_from(&mut self, other: &Message) {
        self.set_len(other.length);
        self.body[..other.length].copy_from_slice(other.body());
        self.target = other.target;
        self.route = other.route;
        self.timeout = other.timeout;
        self.ttl = other.ttl;
        self.priority = other.priority;
        self.token = other.token;
        self.cursor = 0;
    }

    /// Pool-wide identity of the underlying buffer.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn capacity(&self) -> usize {
        self.body.len()
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Sets the body length, growing the buffer when needed.
    pub fn set_len(&mut self, len: usize) {
        self.grow(len);
        self.length = len;
        self.cursor = self.cursor.min(len);
    }

    pub fn body(&self) -> &[u8] {
        &self.body[..self.length]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body[..self.length]
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn set_target(&mut self, target: i32) {
        self.target = target;
    }

    pub fn route(&self) -> u32 {
        self.route
    }

    pub(crate) fn set_route(&mut self, route: u32) {
        self.route = route;
    }

    /// Route timeout in seconds.
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, seconds: u32) {
        self.timeout = seconds;
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.ttl = ttl;
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u32) {
        self.sequence = sequence;
    }

    /// Header length of the frame this message was decoded from.
    pub fn header_length(&self) -> u16 {
        self.header_length
    }

    pub(crate) fn set_header_length(&mut self, len: u16) {
        self.header_length = len;
    }

    /// Opaque value owned by the driver the message arrived on.
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn set_token(&mut self, token: u64) {
        self.token = token;
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Rewinds the cursor to the start of the body.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn length_left(&self) -> usize {
        self.length.saturating_sub(self.cursor)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), MessageError> {
        self.check(n)?;
        self.cursor += n;
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.cursor + bytes.len();
        self.grow(end);
        self.body[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;
        self.length = self.length.max(end);
    }

    pub fn get_into(&mut self, out: &mut [u8]) -> Result<(), MessageError> {
        let bytes = self.get_slice(out.len())?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_slice(&mut self, n: usize) -> Result<&[u8], MessageError> {
        self.check(n)?;
        let start = self.cursor;
        self.cursor += n;
        Ok(&self.body[start..start + n])
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    pub fn get_u8(&mut self) -> Result<u8, MessageError> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn get_u16(&mut self) -> Result<u16, MessageError> {
        Ok(u16::from_be_bytes(self.get_array()?))
    }

    pub fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn get_u32(&mut self) -> Result<u32, MessageError> {
        Ok(u32::from_be_bytes(self.get_array()?))
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn get_i32(&mut self) -> Result<i32, MessageError> {
        Ok(i32::from_be_bytes(self.get_array()?))
    }

    pub fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_be_bytes());
    }

    pub fn get_u64(&mut self) -> Result<u64, MessageError> {
        Ok(u64::from_be_bytes(self.get_array()?))
    }

    /// Little-endian variant of [`Message::put_u16`].
    pub fn put_u16_rev(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_u16_rev(&mut self) -> Result<u16, MessageError> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub fn put_u32_rev(&mut self, value: u32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_u32_rev(&mut self) -> Result<u32, MessageError> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn put_u64_rev(&mut self, value: u64) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_u64_rev(&mut self) -> Result<u64, MessageError> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], MessageError> {
        let mut out = [0; N];
        self.get_into(&mut out)?;
        Ok(out)
    }

    fn check(&self, wanted: usize) -> Result<(), MessageError> {
        let left = self.length_left();
        if wanted > left {
            return Err(MessageError::Underflow { wanted, left });
        }
        Ok(())
    }

    fn grow(&mut self, needed: usize) {
        if needed > self.body.len() {
            self.body.resize(round_capacity(needed), 0);
        }
    }
}
