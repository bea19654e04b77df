//! Volume name hashing
//!
//! The registry keys volumes by a 64-bit digest of their full name so that
//! lookups touch a single bucket.

use xxhash_rust::xxh64::xxh64;

/// Seed for the name hash
const NAME_HASH_SEED: u64 = 0x766f_6c74_785f_6e6d; // "voltx_nm"

/// Compute the registry hash of a volume name
#[must_use]
pub fn name_hash(name: &str) -> u64 {
    xxh64(name.as_bytes(), NAME_HASH_SEED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_is_stable() {
        assert_eq!(name_hash("pool/vol"), name_hash("pool/vol"));
        assert_ne!(name_hash("pool/vol"), name_hash("pool/vol2"));
        assert_ne!(name_hash("pool/vol"), name_hash("pool/vol@snap"));
    }
}
