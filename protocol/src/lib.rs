// Copyright (c) 2026 Lumen Labs. MIT License.
// See LICENSE for details.

//! # Lumen Protocol — Core Library
//!
//! The core of a Lumen proof-of-stake node: the consensus engine together
//! with its immediate collaborators — the append-only block store and the
//! node state reconstructor. These subsystems answer the hard questions of
//! the repository: who proposes the next block, how stake-weighted
//! proposer selection stays deterministic across peers, how a node catches
//! up when it falls behind, and how blockchain state is rebuilt from
//! persisted blocks after a restart.
//!
//! ## Architecture
//!
//! - **crypto** — BLAKE3 hashing, Ed25519 keys, the deterministic election
//!   sampler.
//! - **transaction** — the state-db operation set and the signed envelope.
//! - **storage** — blocks, the file-backed block store with its bounded
//!   in-memory window, chain validation, the path-addressed state db.
//! - **network** — the consensus engine and runner, the transaction pool,
//!   the node state reconstructor, the timer service, and the outbound
//!   transport capability.
//! - **config** — protocol constants and the explicit configuration
//!   records.
//!
//! Network transport itself (sockets, framing, discovery) lives outside
//! this crate; the engine only ever sees the four outbound operations of
//! [`network::TransportOut`].

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;
pub mod transaction;
