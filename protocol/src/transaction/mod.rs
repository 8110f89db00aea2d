//! Transaction construction, signing, and the state-db operation set.

pub mod types;

pub use types::{Operation, Transaction, TransactionData, NONCE_NON_NONCED};
