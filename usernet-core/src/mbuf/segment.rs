use std::{ops::Range, sync::Arc};

/// One physically contiguous piece of a [`Chain`](super::Chain).
///
/// Segments are windows onto shared storage, so slicing or cloning a chain
/// never copies payload bytes. A reassembled datagram is a chain whose
/// segments are the bodies of the original fragments.
#[derive(Debug, Clone)]
pub struct Segment {
    storage: Arc<[u8]>,
    window: Range<usize>,
}

impl Segment {
    pub fn new(bytes: Vec<u8>) -> Self {
        let window = 0..bytes.len();
        Self {
            storage: bytes.into(),
            window,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.window.clone()]
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Narrows the window to its first `len` bytes.
    pub(super) fn shorten(&mut self, len: usize) {
        self.window.end = self.window.start + len.min(self.len());
    }

    /// Drops `count` bytes from the front of the window.
    pub(super) fn advance(&mut self, count: usize) {
        self.window.start = (self.window.start + count).min(self.window.end);
    }

    /// Splits into the first `at` bytes and the rest, sharing storage.
    pub(super) fn split_at(self, at: usize) -> (Segment, Segment) {
        let mut front = self.clone();
        front.shorten(at);
        let mut back = self;
        back.advance(at);
        (front, back)
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl From<Vec<u8>> for Segment {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Segment {
    fn from(slice: &[u8]) -> Self {
        Self::new(slice.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for Segment {
    fn from(array: &[u8; N]) -> Self {
        Self::new(array.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Segment {
    fn from(array: [u8; N]) -> Self {
        Self::new(array.to_vec())
    }
}

impl From<&str> for Segment {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}
