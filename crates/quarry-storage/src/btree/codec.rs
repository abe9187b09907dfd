//! Fixed-width key codecs for B+ tree pages.

/// A key type the B+ tree can store.
///
/// Keys are fixed-width so page capacity is a simple function of the entry
/// stride and `max_size` counts entries, not bytes. Ordering of the decoded
/// values drives every comparison; the encoding only has to round-trip.
pub trait IndexKey: Copy + Ord + Send + Sync + std::fmt::Debug + 'static {
    /// Encoded size in bytes.
    const ENCODED_SIZE: usize;

    /// Serializes into `buf` (at least `ENCODED_SIZE` bytes).
    fn encode(&self, buf: &mut [u8]);

    /// Deserializes from `buf`.
    fn decode(buf: &[u8]) -> Self;
}

impl IndexKey for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
    }
}

impl IndexKey for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        i64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

impl IndexKey for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<K: IndexKey>(key: K) {
        let mut buf = vec![0u8; K::ENCODED_SIZE];
        key.encode(&mut buf);
        assert_eq!(K::decode(&buf), key);
    }

    #[test]
    fn test_i32_roundtrip() {
        for key in [0i32, 1, -1, i32::MIN, i32::MAX] {
            roundtrip(key);
        }
    }

    #[test]
    fn test_i64_roundtrip() {
        for key in [0i64, 42, -42, i64::MIN, i64::MAX] {
            roundtrip(key);
        }
    }

    #[test]
    fn test_u64_roundtrip() {
        for key in [0u64, 1, u64::MAX] {
            roundtrip(key);
        }
    }

    #[test]
    fn test_encode_leaves_trailing_bytes() {
        let mut buf = [0xFFu8; 8];
        7i32.encode(&mut buf);
        assert_eq!(&buf[4..], &[0xFF; 4]);
    }
}
