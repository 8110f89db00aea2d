//! # Block Store — Durable, Ordered Block Persistence
//!
//! One directory per node instance; every block is a gzip-compressed JSON
//! file whose name encodes both the number and the hash:
//!
//! ```text
//! 0000000000-3f18ab...e2.json.gz      (genesis)
//! 0000000001-77cd01...9a.json.gz
//! ```
//!
//! The zero-padded number makes lexicographic directory order equal numeric
//! order, so range queries are a sorted directory listing. The hash in the
//! name serves substring lookups and lets a sync peer detect forks by
//! comparing expected and actual file names without parsing block bodies.
//!
//! ## In-memory window
//!
//! Only the most recent [`MAX_BLOCKS_IN_MEMORY`] blocks stay in memory.
//! When the window overflows, the oldest block is shifted out and its
//! transactions are applied to the snapshot state db — exactly once — so
//! the snapshot plus the window always reproduces the full chain state.
//!
//! ## Startup
//!
//! The first node of a network seeds the canonical genesis. Everyone else
//! loads whatever is on disk and validates it from genesis; a chain that
//! fails validation is purged entirely. Re-syncing from peers beats running
//! on a corrupt chain.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CHAIN_SUBSECT_LENGTH, MAX_BLOCKS_IN_MEMORY};
use crate::storage::block::Block;
use crate::storage::chain::{validate_chain_from_genesis, validate_chain_subsection};
use crate::storage::state::StateDb;

/// Errors from block-store I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chain directory I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("block file {0} is not valid gzip JSON: {1}")]
    Malformed(String, String),
}

// ---------------------------------------------------------------------------
// File naming
// ---------------------------------------------------------------------------

/// File name for a block: `{number:010}-{hash}.json.gz`.
pub fn block_file_name(number: u64, hash: &str) -> String {
    format!("{number:010}-{hash}.json.gz")
}

/// Parse `(number, hash)` back out of a block file name. Returns `None`
/// for files that do not follow the naming scheme.
fn parse_file_name(name: &str) -> Option<(u64, String)> {
    let stem = name.strip_suffix(".json.gz")?;
    let (number, hash) = stem.split_once('-')?;
    Some((number.parse().ok()?, hash.to_string()))
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

/// Durable, ordered sequence of blocks with a bounded in-memory window.
pub struct BlockStore {
    /// Directory holding the block files. Single-writer: this node.
    dir: PathBuf,
    /// The most recent blocks, oldest at the front.
    window: VecDeque<Block>,
    /// State of every block aged out of the window.
    snapshot: StateDb,
    /// Latch: flips true once any non-contradictory sync response arrives,
    /// unblocking normal participation after startup.
    synced_after_startup: bool,
}

impl BlockStore {
    /// Create a store over `dir` without touching the filesystem.
    /// Call [`BlockStore::init`] before use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            window: VecDeque::new(),
            snapshot: StateDb::new(),
            synced_after_startup: false,
        }
    }

    /// Initialize the store.
    ///
    /// Creates the chain directory if absent. The first node of a fresh
    /// network seeds the canonical genesis; otherwise all block files are
    /// loaded and validated from genesis. A chain that fails validation is
    /// destructively purged and the store starts empty.
    pub fn init(&mut self, is_first_node: bool) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let files = self.list_block_files()?;
        if files.is_empty() {
            if is_first_node {
                let genesis = Block::genesis();
                info!(hash = %genesis.hash, "seeding chain directory with genesis block");
                self.write_block_file(&genesis)?;
                self.window.push_back(genesis);
            } else {
                info!(dir = %self.dir.display(), "empty chain directory, awaiting sync");
            }
            return Ok(());
        }

        match self.load_chain(&files) {
            Ok(chain) => {
                info!(blocks = chain.len(), "loaded chain from disk");
                self.absorb_chain(chain);
                Ok(())
            }
            Err(reason) => {
                warn!(%reason, "persisted chain failed validation, purging chain directory");
                self.purge()?;
                Ok(())
            }
        }
    }

    fn load_chain(&self, files: &[(u64, String, PathBuf)]) -> Result<Vec<Block>, String> {
        let mut chain = Vec::with_capacity(files.len());
        for (number, _, path) in files {
            let block = read_block_file(path)
                .map_err(|e| format!("block file {number}: {e}"))?;
            if block.number != *number {
                return Err(format!(
                    "block file {number} contains block number {}",
                    block.number
                ));
            }
            chain.push(block);
        }
        if !validate_chain_from_genesis(&chain) {
            return Err("chain does not validate from genesis".to_string());
        }
        Ok(chain)
    }

    /// Take ownership of a freshly loaded chain: keep the tail in the
    /// window and fold everything older into the snapshot db.
    fn absorb_chain(&mut self, chain: Vec<Block>) {
        let overflow = chain.len().saturating_sub(MAX_BLOCKS_IN_MEMORY);
        for block in &chain[..overflow] {
            self.snapshot.execute_transaction_list(&block.transactions);
        }
        self.window = chain.into_iter().skip(overflow).collect();
    }

    /// Remove every block file and reset all in-memory state.
    fn purge(&mut self) -> Result<(), StoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            fs::remove_file(entry.path())?;
        }
        self.window.clear();
        self.snapshot = StateDb::new();
        Ok(())
    }

    // -- Tail accessors -----------------------------------------------------

    /// The most recent block, if any.
    pub fn last_block(&self) -> Option<&Block> {
        self.window.back()
    }

    /// Number of the most recent block. `None` plays the role of the
    /// reference's `-1`: an empty store expects block 0 next.
    pub fn last_block_number(&self) -> Option<u64> {
        self.last_block().map(|b| b.number)
    }

    /// Timestamp of the most recent block.
    pub fn last_block_timestamp(&self) -> Option<u64> {
        self.last_block().map(|b| b.timestamp)
    }

    /// The number the next appended block must carry.
    pub fn expected_next_number(&self) -> u64 {
        self.last_block_number().map_or(0, |n| n + 1)
    }

    /// The in-memory window, oldest first.
    pub fn in_memory_chain(&self) -> impl DoubleEndedIterator<Item = &Block> {
        self.window.iter()
    }

    /// The snapshot db holding the state of every aged-out block.
    pub fn snapshot(&self) -> &StateDb {
        &self.snapshot
    }

    /// Whether the node has completed (or short-circuited) its first sync.
    pub fn synced_after_startup(&self) -> bool {
        self.synced_after_startup
    }

    /// Reset or set the sync latch. The consensus engine clears it when a
    /// future-height proposal reveals the chain fell behind.
    pub fn set_synced_after_startup(&mut self, synced: bool) {
        self.synced_after_startup = synced;
    }

    // -- Lookups ------------------------------------------------------------

    /// Look up a block by number: window first, then the persisted files.
    pub fn get_block_by_number(&self, number: u64) -> Option<Block> {
        if let Some(block) = self.window.iter().find(|b| b.number == number) {
            return Some(block.clone());
        }
        let files = self.list_block_files().ok()?;
        let (_, _, path) = files.into_iter().find(|(n, _, _)| *n == number)?;
        read_block_file(&path).ok()
    }

    /// Look up a block by hash. A substring match on the file name is
    /// permitted, so hash prefixes work.
    pub fn get_block_by_hash(&self, hash: &str) -> Option<Block> {
        if hash.is_empty() {
            return None;
        }
        if let Some(block) = self.window.iter().find(|b| b.hash.contains(hash)) {
            return Some(block.clone());
        }
        let files = self.list_block_files().ok()?;
        let (_, _, path) = files.into_iter().find(|(_, h, _)| h.contains(hash))?;
        read_block_file(&path).ok()
    }

    /// Block file names in `[from, to)`, clamped: a negative `from` becomes
    /// 0, a negative or oversized `to` becomes `last number + 1`.
    pub fn get_block_file_names(&self, from: i64, to: i64) -> Vec<String> {
        let (from, to) = self.clamp_range(from, to);
        self.list_block_files()
            .unwrap_or_default()
            .into_iter()
            .filter(|(n, _, _)| (from..to).contains(n))
            .map(|(n, h, _)| block_file_name(n, &h))
            .collect()
    }

    /// Blocks in `[from, to)` as concrete values, same clamping rules.
    pub fn get_chain_section(&self, from: i64, to: i64) -> Vec<Block> {
        let (from, to) = self.clamp_range(from, to);
        (from..to)
            .filter_map(|n| self.get_block_by_number(n))
            .collect()
    }

    fn clamp_range(&self, from: i64, to: i64) -> (u64, u64) {
        let end = self.expected_next_number();
        let from = from.max(0) as u64;
        let to = if to < 0 { end } else { (to as u64).min(end) };
        (from, to)
    }

    // -- Append -------------------------------------------------------------

    /// Append a block to the chain.
    ///
    /// Fails (returns `false`) when the block's number is not exactly
    /// `last number + 1`. On success the block file is written and the
    /// window is aged: each shifted-out block applies its transactions to
    /// the snapshot db.
    pub fn add_new_block(&mut self, block: Block) -> bool {
        let expected = self.expected_next_number();
        if block.number != expected {
            warn!(
                got = block.number,
                expected,
                "rejecting block append: number is not contiguous"
            );
            return false;
        }
        if let Err(e) = self.write_block_file(&block) {
            error!(number = block.number, error = %e, "failed to persist block file");
            return false;
        }
        debug!(number = block.number, hash = %block.hash, txs = block.transactions.len(), "block appended");
        self.window.push_back(block);
        while self.window.len() > MAX_BLOCKS_IN_MEMORY {
            let aged = self.window.pop_front().expect("window is non-empty");
            self.snapshot.execute_transaction_list(&aged.transactions);
        }
        true
    }

    // -- Sync serving -------------------------------------------------------

    /// Serve a chain subsection to a peer syncing from `ref_block`.
    ///
    /// At most [`CHAIN_SUBSECT_LENGTH`] blocks starting at
    /// `ref_block.number` inclusive. Four cases:
    ///
    /// 1. The peer is already at our tip → `[last_block]` as an ack.
    /// 2. We have a *different* block at the peer's number → fork; nothing.
    /// 3. Otherwise → the window of blocks.
    /// 4. Nothing to serve → `None`.
    pub fn request_blockchain_section(&self, ref_block: &Block) -> Option<Vec<Block>> {
        let last = self.last_block()?;
        if ref_block.hash == last.hash {
            return Some(vec![last.clone()]);
        }

        if last.number > ref_block.number {
            // We extend past the peer's block; its chain must match ours at
            // that height or the peer is on a fork we will not feed.
            let expected = block_file_name(ref_block.number, &ref_block.hash);
            let have = self
                .get_block_by_number(ref_block.number)
                .map(|b| block_file_name(b.number, &b.hash));
            if have.as_deref() != Some(expected.as_str()) {
                warn!(
                    number = ref_block.number,
                    "sync request references a forked block, refusing to serve"
                );
                return None;
            }
        }

        let from = ref_block.number as i64;
        let to = ref_block.number.saturating_add(CHAIN_SUBSECT_LENGTH as u64) as i64;
        let section = self.get_chain_section(from, to);
        if section.is_empty() {
            None
        } else {
            Some(section)
        }
    }

    // -- Merge --------------------------------------------------------------

    /// Attempt to extend the local chain with a section received from a
    /// peer. Returns `true` only if blocks were actually appended.
    ///
    /// An empty or stale section is not a merge, but it *is* evidence the
    /// peer has nothing newer — the first such response flips the
    /// synced-after-startup latch so the node stops waiting.
    pub fn merge(&mut self, section: Vec<Block>) -> bool {
        let Some(section_last) = section.last() else {
            debug!("peer sent an empty section, treating as up-to-date");
            self.synced_after_startup = true;
            return false;
        };

        if let Some(local_last) = self.last_block_number() {
            if section_last.number <= local_last {
                debug!(
                    section_last = section_last.number,
                    local_last, "section does not extend local chain"
                );
                self.synced_after_startup = true;
                return false;
            }
        }

        let cold_start = self.window.is_empty();
        if cold_start {
            if !section[0].is_genesis_shaped() {
                warn!("cold-start merge rejected: section does not begin at a genesis block");
                return false;
            }
            if !validate_chain_from_genesis(&section) {
                warn!("cold-start merge rejected: section failed genesis validation");
                return false;
            }
            for block in section {
                if !self.add_new_block(block) {
                    error!("merge aborted mid-append");
                    return false;
                }
            }
        } else {
            let local_last = self.last_block().expect("window is non-empty");
            if section[0].hash != local_last.hash {
                warn!(
                    section_first = %section[0].hash,
                    local_last = %local_last.hash,
                    "merge rejected: section does not connect to the local tip"
                );
                return false;
            }
            if !validate_chain_subsection(&section) {
                warn!("merge rejected: section failed validation");
                return false;
            }
            for block in section.into_iter().skip(1) {
                if !self.add_new_block(block) {
                    error!("merge aborted mid-append");
                    return false;
                }
            }
        }

        self.synced_after_startup = true;
        true
    }

    // -- File I/O -----------------------------------------------------------

    fn list_block_files(&self) -> Result<Vec<(u64, String, PathBuf)>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, hash)) = parse_file_name(name) {
                files.push((number, hash, entry.path()));
            }
        }
        files.sort_by_key(|(n, _, _)| *n);
        Ok(files)
    }

    fn write_block_file(&self, block: &Block) -> Result<(), StoreError> {
        let path = self.dir.join(block_file_name(block.number, &block.hash));
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, block)
            .map_err(|e| StoreError::Malformed(path.display().to_string(), e.to_string()))?;
        encoder.finish()?;
        Ok(())
    }
}

fn read_block_file(path: &Path) -> Result<Block, StoreError> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    serde_json::from_reader(decoder)
        .map_err(|e| StoreError::Malformed(path.display().to_string(), e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
