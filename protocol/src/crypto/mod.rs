//! Cryptographic primitives: BLAKE3 hashing and Ed25519 keys.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hex, seed_to_unit};
pub use keys::{verify_signature, KeyError, LumenKeypair};
