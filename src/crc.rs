//! CRC-32 over byte slices.
//!
//! Digests are carried as `i32` (two's complement of the u32 digest) to match
//! the persisted column type and the manifest records on the wire.

use crc32fast::Hasher;

pub fn crc32(bytes: &[u8]) -> i32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize() as i32
}

#[cfg(test)]
mod tests {
    use super::crc32;

    #[test]
    fn crc32_known_vector() {
        // IEEE polynomial, "123456789" -> 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926u32 as i32);
    }

    #[test]
    fn crc32_differs_on_content() {
        assert_ne!(crc32(b"alpha"), crc32(b"alphb"));
        assert_eq!(crc32(b""), 0);
    }
}
