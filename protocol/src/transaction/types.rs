//! Core transaction types: state-db operations and the signed envelope.
//!
//! A Lumen transaction is a single [`Operation`] against the path-addressed
//! state db, wrapped in an envelope carrying the sender address, a nonce,
//! a millisecond timestamp, and an Ed25519 signature. The transaction id is
//! the BLAKE3 hash of the canonical signable bytes, so it is stable across
//! signing.
//!
//! Nonces are `i64` with a reserved value: `-1` marks a non-nonced
//! transaction that is exempt from per-account ordering (consensus-internal
//! writes use these). Everything `>= 0` participates in the usual
//! monotonic per-account sequence.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::hash::blake3_hex;
use crate::crypto::keys::{verify_signature, LumenKeypair};

/// Nonce value marking a transaction as exempt from account ordering.
pub const NONCE_NON_NONCED: i64 = -1;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A state-db mutation.
///
/// Paths are `/`-separated semantic keys into the JSON state tree, e.g.
/// `/consensus/number/7/propose`. Writing JSON `null` with `SET_VALUE`
/// deletes the subtree at the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Write (or, with a `null` value, delete) the subtree at `ref`.
    #[serde(rename = "SET_VALUE")]
    SetValue {
        #[serde(rename = "ref")]
        reference: String,
        value: Value,
    },
    /// Add `value` to the integer at `ref`, treating a missing leaf as 0.
    #[serde(rename = "INC_VALUE")]
    IncValue {
        #[serde(rename = "ref")]
        reference: String,
        value: i64,
    },
    /// Subtract `value` from the integer at `ref`.
    #[serde(rename = "DEC_VALUE")]
    DecValue {
        #[serde(rename = "ref")]
        reference: String,
        value: i64,
    },
    /// Apply several operations atomically, in order.
    #[serde(rename = "SET")]
    SetList { op_list: Vec<Operation> },
}

impl Operation {
    /// Convenience constructor for the most common operation.
    pub fn set_value(reference: impl Into<String>, value: Value) -> Self {
        Self::SetValue {
            reference: reference.into(),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionData
// ---------------------------------------------------------------------------

/// Input to [`crate::network::node::Node::create_transaction`].
///
/// `address` overrides the sender recorded on the envelope. An override
/// means the local key cannot have produced a matching signature, so the
/// built transaction is flagged `skip_verif` and downstream signature
/// verification is disabled for it.
#[derive(Debug, Clone)]
pub struct TransactionData {
    /// The state mutation to perform.
    pub operation: Operation,
    /// Optional sender override (disables signature verification).
    pub address: Option<String>,
}

impl TransactionData {
    /// Transaction data for the local account (no override).
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            address: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A signed state-db mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// `blake3(signable_bytes)`, hex. Stable across signing.
    pub id: String,
    /// Sender account address (lowercase hex public key).
    pub address: String,
    /// The state mutation.
    pub operation: Operation,
    /// Per-account sequence number, or [`NONCE_NON_NONCED`].
    pub nonce: i64,
    /// Creation time, Unix milliseconds.
    pub timestamp: u64,
    /// When set, downstream signature verification is skipped. Set by an
    /// `address` override in [`TransactionData`].
    #[serde(default)]
    pub skip_verif: bool,
    /// Hex Ed25519 signature over [`Transaction::signable_bytes`].
    /// `None` until signed.
    pub signature: Option<String>,
}

impl Transaction {
    /// Build an unsigned transaction stamped with the current wall clock.
    pub fn new(operation: Operation, address: impl Into<String>, nonce: i64) -> Self {
        Self::with_timestamp(
            operation,
            address,
            nonce,
            Utc::now().timestamp_millis() as u64,
        )
    }

    /// Build an unsigned transaction with an explicit timestamp.
    pub fn with_timestamp(
        operation: Operation,
        address: impl Into<String>,
        nonce: i64,
        timestamp: u64,
    ) -> Self {
        let mut tx = Self {
            id: String::new(),
            address: address.into(),
            operation,
            nonce,
            timestamp,
            skip_verif: false,
            signature: None,
        };
        tx.id = tx.compute_id();
        tx
    }

    /// Canonical byte representation used for the id and the signature.
    ///
    /// A deterministic concatenation with null-byte separators: address,
    /// JSON-serialized operation, nonce and timestamp as little-endian
    /// integers. Serde emits struct fields in declaration order, so the
    /// operation JSON is stable for a given protocol version. The
    /// `signature` and `skip_verif` fields are excluded.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.address.as_bytes());
        buf.push(0x00);
        let op_json = serde_json::to_vec(&self.operation)
            .expect("operation serialization cannot fail: no non-string map keys");
        buf.extend_from_slice(&op_json);
        buf.push(0x00);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Recompute the transaction id from the current field values.
    pub fn compute_id(&self) -> String {
        blake3_hex(&self.signable_bytes())
    }

    /// Sign in place with `keypair`. Overwrites any prior signature.
    pub fn sign(&mut self, keypair: &LumenKeypair) {
        self.signature = Some(keypair.sign(&self.signable_bytes()));
    }

    /// Verify envelope integrity: id matches content, and — unless
    /// `skip_verif` — the signature checks out against `address`.
    pub fn verify(&self) -> bool {
        if self.id != self.compute_id() {
            return false;
        }
        if self.skip_verif {
            return true;
        }
        match &self.signature {
            Some(sig) => verify_signature(&self.address, &self.signable_bytes(), sig),
            None => false,
        }
    }

    /// Whether this transaction participates in per-account nonce ordering.
    pub fn is_nonced(&self) -> bool {
        self.nonce >= 0
    }
}
