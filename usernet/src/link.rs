//! The emulator side of the virtual link.
//!
//! QEMU's `stream` and `socket` netdevs carry one Ethernet frame per record:
//! a 4-byte big-endian length followed by the frame itself.

use std::io::{self, Write};
use thiserror::Error as ThisError;

/// Size of the length prefix
pub const PREFIX_LEN: usize = 4;
/// Largest frame accepted from the emulator
pub const MAX_FRAME: usize = 65_550;

#[derive(Debug, ThisError)]
pub enum LinkError {
    #[error("The emulator sent a {0}-byte frame")]
    Oversized(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Splits the byte stream from the emulator into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next whole frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        let Some(&[a, b, c, d]) = self.buf.get(..PREFIX_LEN) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([a, b, c, d]) as usize;
        if len > MAX_FRAME {
            return Err(LinkError::Oversized(len));
        }
        if self.buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let frame = self.buf[PREFIX_LEN..PREFIX_LEN + len].to_vec();
        self.buf.drain(..PREFIX_LEN + len);
        Ok(Some(frame))
    }

    /// Bytes held toward an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Frames waiting to be written to the emulator. The link socket is
/// non-blocking, so whatever it will not take yet stays here for the next
/// flush.
#[derive(Debug, Default)]
pub struct FrameWriter {
    pending: Vec<u8>,
}

impl FrameWriter {
    pub fn push(&mut self, frame: &[u8]) {
        self.pending.reserve(PREFIX_LEN + frame.len());
        self.pending
            .extend_from_slice(&(frame.len() as u32).to_be_bytes());
        self.pending.extend_from_slice(frame);
    }

    /// Writes as much as `out` accepts without blocking.
    pub fn flush(&mut self, out: &mut impl Write) -> io::Result<()> {
        while !self.pending.is_empty() {
            match out.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
