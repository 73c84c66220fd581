use std::io::{Read, Write};

use crate::message::{Message, MessagePool};

use super::header::{self, FrameError, Header, PREFIX_LENGTH};

/// Reads and writes whole frames on a byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    max_frame: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T, max_frame: usize) -> Self {
        Self { stream, max_frame }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), FrameError> {
        self.stream.write_all(&header::encode(message))?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until a complete frame arrives and decodes it into a message
    /// taken from `pool`.
    pub fn read_message(&mut self, pool: &MessagePool) -> Result<Message, FrameError> {
        let mut prefix = [0; PREFIX_LENGTH];
        self.stream.read_exact(&mut prefix)?;
        let total = Header::check_prefix(&prefix, self.max_frame)?;

        let mut frame = vec![0; total];
        frame[..PREFIX_LENGTH].copy_from_slice(&prefix);
        self.stream.read_exact(&mut frame[PREFIX_LENGTH..])?;
        header::decode(&frame, pool, self.max_frame)
    }
}
