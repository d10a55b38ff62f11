use serde::{Serialize, Serializer};

/// Atomic reference-counted string type used for names and identifiers.
pub(crate) type ArcStr = std::sync::Arc<str>;

/// A 32-byte BLAKE3 hash used as the identity of a [`Task`](crate::Task).
///
/// The same value serves three purposes at once:
/// 1. It is the deduplication key of the [`Dispatcher`](crate::Dispatcher),
///    two tasks with equal hashes are the same work and run once.
/// 2. It is the node identity of the [`ResolvedGraph`](crate::ResolvedGraph).
/// 3. It is a stable cache key callers may use to remember finished work.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// The identity shared by every no-op task, regardless of template or
    /// context.
    pub const NO_OP: Hash32 = Hash32([0xff; 32]);

    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// First 8 hex digits, handy in log lines.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// Adapter that lets any [`std::hash::Hash`] value be folded into a BLAKE3
/// digest.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use std::hash::Hash;

    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash(b"frame");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(hash.short().len(), 8);
        assert!(hash.to_hex().starts_with(&hash.short()));
    }

    #[test]
    fn test_hasher_is_deterministic() {
        let digest = |value: &str| -> Hash32 {
            let mut hasher = Blake3Hasher::default();
            value.hash(&mut hasher);
            hasher.into()
        };

        assert_eq!(digest("writer"), digest("writer"));
        assert_ne!(digest("writer"), digest("reader"));
    }

    #[test]
    fn test_no_op_sentinel_differs_from_empty_digest() {
        let empty: Hash32 = Blake3Hasher::default().into();
        assert_ne!(empty, Hash32::NO_OP);
    }

    #[test]
    fn test_serializes_as_hex() {
        let hash = Hash32::hash(b"a");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }
}
