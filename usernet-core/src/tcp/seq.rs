//! Sequence number comparisons on the 32-bit ring (RFC 9293 section 3.4).
//!
//! Two sequence numbers compare by the sign of their wrapping difference, so
//! any pair less than 2^31 apart orders correctly across the wrap.

/// a < b
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b
pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// a > b
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// a >= b
pub fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// The later of two sequence numbers
pub fn seq_max(a: u32, b: u32) -> u32 {
    if seq_gt(a, b) {
        a
    } else {
        b
    }
}

/// Is `seq` in the half-open window `[start, start + len)`? An empty window
/// contains nothing.
pub fn in_window(start: u32, seq: u32, len: u32) -> bool {
    seq_leq(start, seq) && seq_lt(seq, start.wrapping_add(len))
}

/// How far `later` is past `earlier`, zero if it is not past it at all.
pub fn seq_distance(earlier: u32, later: u32) -> u32 {
    if seq_gt(later, earlier) {
        later.wrapping_sub(earlier)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(seq_lt(10, 20));
        assert!(!seq_lt(20, 10));
        assert!(seq_lt(2_000_000_000, 3_000_000_000));
        assert!(!seq_lt(3_000_000_000, 2_000_000_000));
        assert!(!seq_lt(5, 5));
        assert!(seq_leq(5, 5));
        assert!(seq_gt(20, 10));
        assert!(!seq_gt(5, 5));
        assert!(seq_geq(5, 5));
    }

    #[test]
    fn wraparound() {
        assert!(seq_lt(0xffff_fff0, 0x10));
        assert!(seq_gt(0x10, 0xffff_fff0));
        assert!(!seq_lt(0x10, 0xffff_fff0));
        assert_eq!(seq_max(0xffff_fff0, 0x10), 0x10);
        assert_eq!(seq_distance(0xffff_fff0, 0x10), 0x20);
        assert_eq!(seq_distance(0x10, 0xffff_fff0), 0);
    }

    #[test]
    fn windows() {
        assert!(in_window(100, 100, 10));
        assert!(in_window(100, 109, 10));
        assert!(!in_window(100, 110, 10));
        assert!(!in_window(100, 99, 10));
        assert!(!in_window(100, 100, 0));
        assert!(in_window(u32::MAX - 5, 3, 16));
    }
}
