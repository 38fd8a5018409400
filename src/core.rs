use std::any::Any;
use std::sync::Arc;

/// A type-erased, thread-safe container.
///
/// Every value that flows between tasks (scene lists, artifact paths, remote
/// references) is stored behind this type, so the scheduler and the result
/// store never need to know what an operator produced.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 digest.
///
/// Used to derive stable task identifiers: the same input parts always hash
/// to the same digest, across runs and across processes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Hashes a sequence of parts, each prefixed with its length so that
    /// `("ab", "c")` and `("a", "bc")` never collide.
    pub(crate) fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();

        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }

        hasher.finalize().into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let parts = || [b"daraa".as_slice(), b"search".as_slice()];
        assert_eq!(Hash32::hash_parts(parts()), Hash32::hash_parts(parts()));
        assert_ne!(Hash32::hash_parts(parts()), Hash32::hash_parts([b"homs".as_slice()]));
    }

    #[test]
    fn test_hash_parts_are_length_prefixed() {
        let a = Hash32::hash_parts([b"ab".as_slice(), b"c".as_slice()]);
        let b = Hash32::hash_parts([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_is_64_chars() {
        let hex = Hash32::hash_parts([b"x".as_slice()]).to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
