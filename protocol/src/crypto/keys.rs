//! # Key Management
//!
//! Ed25519 keypairs for Lumen accounts. Every address on the network is the
//! lowercase hex encoding of an Ed25519 public key; every block proposal and
//! transaction signature traces back to one of these.
//!
//! Two creation paths exist:
//!
//! - [`LumenKeypair::generate`] — fresh random key from the OS RNG. What a
//!   production validator uses.
//! - [`LumenKeypair::from_account_index`] — deterministic dev keypair
//!   selected by index. Lets a local multi-node testnet assign every peer a
//!   stable, well-known identity without shipping key files around.
//!
//! Private keys never implement `Serialize`. Exporting secret material is a
//! deliberate act via `secret_key_bytes()`, not a serde accident.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::config::DEV_ACCOUNT_SEED_PREFIX;
use crate::crypto::hash::blake3_hash;

/// Errors from key parsing and signature verification.
///
/// Deliberately vague about *why* a key failed to parse — error messages
/// are not the place to leak structure of key material.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// An Ed25519 keypair identifying one Lumen account.
#[derive(Clone)]
pub struct LumenKeypair {
    signing_key: SigningKey,
    /// Cached lowercase-hex address; derived once at construction.
    address: String,
}

impl std::fmt::Debug for LumenKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the signing key.
        f.debug_struct("LumenKeypair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl LumenKeypair {
    /// Generate a fresh keypair from the OS cryptographic RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Construct a keypair deterministically from a 32-byte seed.
    ///
    /// The seed is used directly as the Ed25519 secret scalar. A weak seed
    /// gives a weak key; feed it CSPRNG or KDF output only.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// The pre-generated development keypair at `index`.
    ///
    /// Seeded by `blake3("{DEV_ACCOUNT_SEED_PREFIX}{index}")`, so the same
    /// index yields the same identity on every machine. Dev and test use
    /// only — the seeds are public by construction.
    pub fn from_account_index(index: u32) -> Self {
        let seed = blake3_hash(format!("{DEV_ACCOUNT_SEED_PREFIX}{index}").as_bytes());
        Self::from_seed(&seed)
    }

    /// Reconstruct a keypair from a hex-encoded 32-byte secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            address,
        }
    }

    /// The account address: lowercase hex of the Ed25519 public key.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message; returns the 64-byte signature hex-encoded.
    ///
    /// Ed25519 is deterministic: the same (key, message) pair always
    /// produces the same signature, so resigning is idempotent.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Export the raw 32-byte secret key. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Verify a hex-encoded Ed25519 signature made by `address` over `message`.
///
/// Any malformed input — a non-hex address, a short signature, a point that
/// does not decode — verifies as `false` rather than erroring. Callers on
/// the message-handling path want a predicate, not a parse tree.
pub fn verify_signature(address: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(address) else {
        return false;
    };
    let Ok(pk_array) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_array) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = DalekSignature::from_bytes(&sig_array);
    verifying_key.verify(message, &signature).is_ok()
}
