use super::Segment;
use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    ops::{Bound, RangeBounds},
};

/// The logical bytes of one packet, possibly spread across several
/// physically separate segments.
///
/// Prepending a header, stripping one, splitting a payload at an MSS boundary,
/// and joining fragment bodies back together are all done without copying the
/// payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    segments: VecDeque<Segment>,
    len: usize,
}

impl Chain {
    /// Creates a chain holding a single segment.
    ///
    /// ```
    /// # use usernet_core::mbuf::Chain;
    /// let chain = Chain::new(b"payload");
    /// assert_eq!(chain.len(), 7);
    /// ```
    pub fn new(body: impl Into<Segment>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut segments = VecDeque::new();
        if len > 0 {
            segments.push_back(body);
        }
        Self { segments, len }
    }

    /// Puts a header in front of the existing bytes.
    ///
    /// ```
    /// # use usernet_core::mbuf::Chain;
    /// let mut chain = Chain::new(b"data");
    /// chain.prepend(b"hdr:");
    /// assert_eq!(chain.to_vec(), b"hdr:data");
    /// ```
    pub fn prepend(&mut self, header: impl Into<Segment>) {
        let header = header.into();
        if header.is_empty() {
            return;
        }
        self.len += header.len();
        self.segments.push_front(header);
    }

    /// Moves every segment of `other` onto the end of this chain.
    pub fn append(&mut self, other: Chain) {
        self.len += other.len;
        self.segments.extend(other.segments);
    }

    /// Narrows the chain to the given range of its current bytes.
    ///
    /// ```
    /// # use usernet_core::mbuf::Chain;
    /// let mut chain = Chain::new(b"Body");
    /// chain.prepend(b"Header");
    /// chain.slice(3..8);
    /// assert_eq!(chain.to_vec(), b"derBo");
    /// ```
    pub fn slice(&mut self, range: impl RangeBounds<usize>) {
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i + 1,
            Bound::Excluded(&i) => i,
            Bound::Unbounded => self.len,
        };
        assert!(start <= end && end <= self.len, "slice out of bounds");
        self.truncate(end);
        self.remove_front(start);
    }

    /// Drops bytes past `len`. Does nothing if the chain is already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let mut keep = len;
        let mut kept_segments = 0;
        for segment in self.segments.iter_mut() {
            if keep == 0 {
                break;
            }
            kept_segments += 1;
            if segment.len() >= keep {
                segment.shorten(keep);
                keep = 0;
            } else {
                keep -= segment.len();
            }
        }
        self.segments.truncate(kept_segments);
        self.len = len;
    }

    /// Splits off the first `len` bytes and returns them as their own chain.
    pub fn cut(&mut self, len: usize) -> Chain {
        assert!(len <= self.len, "cut past end of chain");
        let mut front = VecDeque::new();
        let mut remaining = len;
        while remaining > 0 {
            let Some(head) = self.segments.pop_front() else {
                break;
            };
            if head.len() <= remaining {
                remaining -= head.len();
                front.push_back(head);
            } else {
                let (piece, rest) = head.split_at(remaining);
                front.push_back(piece);
                self.segments.push_front(rest);
                remaining = 0;
            }
        }
        self.len -= len;
        Chain {
            segments: front,
            len,
        }
    }

    /// Discards the first `len` bytes.
    pub fn remove_front(&mut self, len: usize) {
        assert!(len <= self.len, "removed past end of chain");
        self.len -= len;
        let mut remaining = len;
        while let Some(head) = self.segments.front_mut() {
            if head.len() <= remaining {
                remaining -= head.len();
                self.segments.pop_front();
            } else {
                head.advance(remaining);
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates every byte of the chain in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.segments().flat_map(|bytes| bytes.iter().copied())
    }

    /// Iterates the physically contiguous pieces of the chain.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// The number of physical segments backing the chain.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copies bytes starting at `offset` into `out`, returning how many were
    /// copied.
    pub fn copy_to(&self, mut offset: usize, out: &mut [u8]) -> usize {
        let mut written = 0;
        for piece in self.segments() {
            if written == out.len() {
                break;
            }
            if offset >= piece.len() {
                offset -= piece.len();
                continue;
            }
            let piece = &piece[offset..];
            offset = 0;
            let n = piece.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&piece[..n]);
            written += n;
        }
        written
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for piece in self.segments() {
            out.extend_from_slice(piece);
        }
        out
    }
}

impl Display for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x} ")?;
        }
        Ok(())
    }
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Chain {}

impl From<Vec<u8>> for Chain {
    fn from(bytes: Vec<u8>) -> Self {
        Chain::new(bytes)
    }
}

impl From<&[u8]> for Chain {
    fn from(bytes: &[u8]) -> Self {
        Chain::new(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for Chain {
    fn from(bytes: [u8; N]) -> Self {
        Chain::new(bytes)
    }
}
