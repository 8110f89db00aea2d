//! # Hashing Utilities
//!
//! BLAKE3 is the only hash function in Lumen. Block hashes, transaction ids,
//! and the proposer-election sampler all reduce to it. One function, one
//! security analysis, no interop museum.
//!
//! ## seed_to_unit
//!
//! Proposer election needs one deterministic floating-point sample in
//! `[0, 1)` per `(seed block, round)` pair, identical on every honest node.
//! We hash the seed string with BLAKE3, take the first 8 bytes big-endian,
//! shift right by 11 to keep exactly the 53 bits an IEEE-754 double can
//! represent losslessly, and divide by 2^53. The construction is part of
//! the protocol version — a peer with a different sampler elects different
//! proposers.

/// Compute the BLAKE3 hash of the input data as a fixed-size array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Compute the BLAKE3 hash and return it as a lowercase hex string.
///
/// This is the canonical textual form of every hash in the protocol:
/// block hashes, transaction ids, chain file names.
pub fn blake3_hex(data: &[u8]) -> String {
    hex::encode(blake3_hash(data))
}

/// Map a seed string to a uniform double in `[0, 1)`.
///
/// Deterministic across platforms: the 53 retained bits fit the double
/// mantissa exactly, so there is no rounding and no platform-dependent
/// floating-point behavior involved.
pub fn seed_to_unit(seed: &str) -> f64 {
    let digest = blake3_hash(seed.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(raw) >> 11;
    bits as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"lumen"), blake3_hash(b"lumen"));
        assert_ne!(blake3_hash(b"lumen"), blake3_hash(b"lumen2"));
    }

    #[test]
    fn hex_form_matches_array_form() {
        let data = b"block preimage";
        assert_eq!(blake3_hex(data), hex::encode(blake3_hash(data)));
        assert_eq!(blake3_hex(data).len(), 64);
    }

    #[test]
    fn seed_to_unit_is_deterministic() {
        let a = seed_to_unit("deadbeef0");
        let b = seed_to_unit("deadbeef0");
        assert_eq!(a, b);
    }

    #[test]
    fn seed_to_unit_stays_in_unit_interval() {
        for i in 0..1000 {
            let r = seed_to_unit(&format!("seed-{i}"));
            assert!((0.0..1.0).contains(&r), "sample {r} escaped [0, 1)");
        }
    }

    #[test]
    fn seed_to_unit_differs_across_rounds() {
        // The round number is appended in decimal to the seed-block hash;
        // consecutive rounds must produce different samples.
        let r0 = seed_to_unit("deadbeef0");
        let r1 = seed_to_unit("deadbeef1");
        assert_ne!(r0, r1);
    }
}
