//! # State DB — Path-Addressed JSON Tree
//!
//! The mutable key/value view the consensus engine reads and writes.
//! Values live in a JSON tree addressed by `/`-separated paths:
//!
//! | Path | Content |
//! |---|---|
//! | `/consensus/number/<n>/propose` | proposal record for height n |
//! | `/consensus/number/<n>/register/<addr>` | registration `{block_hash, stake}` |
//! | `/deposit/consensus/<addr>/<push_id>/value` | deposit request |
//! | `/deposit_accounts/consensus/<addr>` | canonical deposit `{value, expire_at}` |
//!
//! Writing JSON `null` deletes the subtree at the path — that is how aged-
//! out consensus records are garbage-collected. Intermediate nodes are
//! created on demand; a write through a scalar replaces it with an object.
//!
//! The db is ephemeral: the node rebuilds it from the snapshot db plus the
//! in-memory chain plus the pool on every reconstruct, so there is nothing
//! to persist here.

use serde_json::{Map, Value};
use tracing::trace;

use crate::transaction::{Operation, Transaction};

/// Path-addressed JSON state tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDb {
    root: Map<String, Value>,
}

impl StateDb {
    /// An empty state tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the value at `path`. Returns a clone, `None` if absent.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        let segments = split_path(path);
        if segments.is_empty() {
            return Some(Value::Object(self.root.clone()));
        }
        let mut map = &self.root;
        for segment in &segments[..segments.len() - 1] {
            map = map.get(*segment)?.as_object()?;
        }
        map.get(segments[segments.len() - 1]).cloned()
    }

    /// Write `value` at `path`, creating intermediate objects as needed.
    /// A `null` value deletes the subtree at the path instead.
    pub fn set_value(&mut self, path: &str, value: Value) {
        let segments = split_path(path);
        if segments.is_empty() {
            return;
        }
        if value.is_null() {
            trace!(path, "state delete");
            Self::delete_at(&mut self.root, &segments);
            return;
        }
        trace!(path, "state write");
        let mut map = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let entry = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = entry.as_object_mut().expect("just ensured object");
        }
        map.insert(segments[segments.len() - 1].to_string(), value);
    }

    /// Add `delta` to the integer leaf at `path`, treating absent or
    /// non-integer leaves as 0.
    pub fn inc_value(&mut self, path: &str, delta: i64) {
        let current = self
            .get_value(path)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        self.set_value(path, Value::from(current + delta));
    }

    /// Subtract `delta` from the integer leaf at `path`.
    pub fn dec_value(&mut self, path: &str, delta: i64) {
        self.inc_value(path, -delta);
    }

    /// Apply one transaction's operation to the tree, then fold any
    /// deposit requests it carried into the canonical deposit accounts.
    pub fn execute_transaction(&mut self, tx: &Transaction) {
        self.execute_operation(&tx.operation);
        self.process_deposit_requests(&tx.operation, tx.timestamp);
    }

    /// Apply a list of transactions in order.
    pub fn execute_transaction_list(&mut self, txs: &[Transaction]) {
        for tx in txs {
            self.execute_transaction(tx);
        }
    }

    /// Replace this db's entire contents with a copy of `snapshot`.
    pub fn set_db_to_snapshot(&mut self, snapshot: &StateDb) {
        self.root = snapshot.root.clone();
    }

    /// Credit deposit accounts for every deposit request inside `op`.
    ///
    /// A write to `/deposit/consensus/<addr>/<push_id>/value` is a request;
    /// processing it adds the amount to
    /// `/deposit_accounts/consensus/<addr>/value` and stamps
    /// `expire_at = timestamp + DEPOSIT_EXPIRY`. Driven by the transaction
    /// timestamp — never the wall clock — so replay during reconstruction
    /// reproduces identical account state.
    fn process_deposit_requests(&mut self, op: &Operation, timestamp: u64) {
        match op {
            Operation::SetValue { reference, value } => {
                let segments = split_path(reference);
                let is_request = matches!(
                    segments.as_slice(),
                    ["deposit", "consensus", _, _, "value"]
                );
                if !is_request {
                    return;
                }
                let Some(amount) = value.as_u64() else {
                    trace!(path = %reference, "ignoring non-integer deposit request");
                    return;
                };
                let address = segments[2];
                let account = format!("/deposit_accounts/consensus/{address}");
                self.inc_value(&format!("{account}/value"), amount as i64);
                self.set_value(
                    &format!("{account}/expire_at"),
                    Value::from(timestamp + crate::config::DEPOSIT_EXPIRY.as_millis() as u64),
                );
            }
            Operation::SetList { op_list } => {
                for inner in op_list {
                    self.process_deposit_requests(inner, timestamp);
                }
            }
            _ => {}
        }
    }

    fn execute_operation(&mut self, op: &Operation) {
        match op {
            Operation::SetValue { reference, value } => self.set_value(reference, value.clone()),
            Operation::IncValue { reference, value } => self.inc_value(reference, *value),
            Operation::DecValue { reference, value } => self.dec_value(reference, *value),
            Operation::SetList { op_list } => {
                for inner in op_list {
                    self.execute_operation(inner);
                }
            }
        }
    }

    fn delete_at(map: &mut Map<String, Value>, segments: &[&str]) {
        if segments.len() == 1 {
            map.remove(segments[0]);
            return;
        }
        if let Some(child) = map.get_mut(segments[0]).and_then(|v| v.as_object_mut()) {
            Self::delete_at(child, &segments[1..]);
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::NONCE_NON_NONCED;
    use serde_json::json;

    #[test]
    fn set_and_get_roundtrip() {
        let mut db = StateDb::new();
        db.set_value(
            "/deposit_accounts/consensus/ab12",
            json!({"value": 100, "expire_at": 999}),
        );
        let got = db.get_value("/deposit_accounts/consensus/ab12").unwrap();
        assert_eq!(got["value"], 100);
        assert_eq!(got["expire_at"], 999);
        // Intermediate nodes are readable too.
        assert!(db.get_value("/deposit_accounts/consensus").is_some());
    }

    #[test]
    fn missing_path_reads_none() {
        let db = StateDb::new();
        assert!(db.get_value("/consensus/number/1/propose").is_none());
    }

    #[test]
    fn null_write_deletes_subtree() {
        let mut db = StateDb::new();
        db.set_value("/consensus/number/1/propose", json!({"number": 1}));
        db.set_value("/consensus/number/1/register/aa", json!({"stake": 5}));
        db.set_value("/consensus/number/1", Value::Null);
        assert!(db.get_value("/consensus/number/1").is_none());
        assert!(db.get_value("/consensus/number/1/propose").is_none());
        // Sibling heights are untouched.
        db.set_value("/consensus/number/2/propose", json!({"number": 2}));
        db.set_value("/consensus/number/1", Value::Null);
        assert!(db.get_value("/consensus/number/2/propose").is_some());
    }

    #[test]
    fn write_through_scalar_replaces_it() {
        let mut db = StateDb::new();
        db.set_value("/a", json!(7));
        db.set_value("/a/b", json!(1));
        assert_eq!(db.get_value("/a/b").unwrap(), json!(1));
    }

    #[test]
    fn inc_dec_treat_missing_as_zero() {
        let mut db = StateDb::new();
        db.inc_value("/counters/x", 5);
        assert_eq!(db.get_value("/counters/x").unwrap(), json!(5));
        db.dec_value("/counters/x", 2);
        assert_eq!(db.get_value("/counters/x").unwrap(), json!(3));
        db.dec_value("/counters/fresh", 4);
        assert_eq!(db.get_value("/counters/fresh").unwrap(), json!(-4));
    }

    #[test]
    fn execute_transaction_list_applies_in_order() {
        let mut db = StateDb::new();
        let txs = vec![
            Transaction::with_timestamp(
                Operation::set_value("/values/x", json!(1)),
                "aa",
                NONCE_NON_NONCED,
                1,
            ),
            Transaction::with_timestamp(
                Operation::set_value("/values/x", json!(2)),
                "aa",
                NONCE_NON_NONCED,
                2,
            ),
        ];
        db.execute_transaction_list(&txs);
        assert_eq!(db.get_value("/values/x").unwrap(), json!(2));
    }

    #[test]
    fn set_list_is_applied_atomically_in_order() {
        let mut db = StateDb::new();
        let tx = Transaction::with_timestamp(
            Operation::SetList {
                op_list: vec![
                    Operation::set_value("/consensus/number/5/propose", json!({"number": 5})),
                    Operation::set_value("/consensus/number/1", Value::Null),
                ],
            },
            "aa",
            NONCE_NON_NONCED,
            1,
        );
        db.set_value("/consensus/number/1/propose", json!({"number": 1}));
        db.execute_transaction(&tx);
        assert!(db.get_value("/consensus/number/5/propose").is_some());
        assert!(db.get_value("/consensus/number/1").is_none());
    }

    #[test]
    fn deposit_request_credits_canonical_account() {
        let mut db = StateDb::new();
        let stamp = 1_700_000_000_000u64;
        let tx = Transaction::with_timestamp(
            Operation::set_value("/deposit/consensus/ab12/push-1/value", json!(100)),
            "ab12",
            0,
            stamp,
        );
        db.execute_transaction(&tx);

        let account = db.get_value("/deposit_accounts/consensus/ab12").unwrap();
        assert_eq!(account["value"], 100);
        assert_eq!(
            account["expire_at"],
            json!(stamp + crate::config::DEPOSIT_EXPIRY.as_millis() as u64)
        );

        // A second request from a new push id accumulates.
        let tx2 = Transaction::with_timestamp(
            Operation::set_value("/deposit/consensus/ab12/push-2/value", json!(50)),
            "ab12",
            1,
            stamp + 5,
        );
        db.execute_transaction(&tx2);
        let account = db.get_value("/deposit_accounts/consensus/ab12").unwrap();
        assert_eq!(account["value"], 150);
    }

    #[test]
    fn non_deposit_paths_do_not_touch_accounts() {
        let mut db = StateDb::new();
        let tx = Transaction::with_timestamp(
            Operation::set_value("/deposit/consensus/ab12/incomplete", json!(9)),
            "ab12",
            0,
            1,
        );
        db.execute_transaction(&tx);
        assert!(db.get_value("/deposit_accounts/consensus/ab12").is_none());
    }

    #[test]
    fn snapshot_copy_is_deep() {
        let mut snapshot = StateDb::new();
        snapshot.set_value("/a/b", json!(1));

        let mut live = StateDb::new();
        live.set_value("/stale", json!(true));
        live.set_db_to_snapshot(&snapshot);

        assert!(live.get_value("/stale").is_none());
        assert_eq!(live.get_value("/a/b").unwrap(), json!(1));

        // Mutating the live copy must not leak back into the snapshot.
        live.set_value("/a/b", json!(2));
        assert_eq!(snapshot.get_value("/a/b").unwrap(), json!(1));
    }
}
