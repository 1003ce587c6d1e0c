//! AT-mode global row locks. A lock row is `(row_key, xid, branch_id)`;
//! acquisition is idempotent for the owning xid and conflicts for everyone
//! else. Conflicting acquisition retries on a short jittered interval up to
//! a bounded attempt count before surfacing `LockConflict`.

use common::config::LockConfig;
use common::util::time::now_ms;
use common::{BranchId, ErrorKind, TxError, TxResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use getset::Getters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// `resourceId:table:pk` — one lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowKey(String);

impl RowKey {
    pub fn new(resource_id: &str, table: &str, pk: &str) -> Self {
        Self(format!("{}:{}:{}", resource_id, table, pk))
    }

    /// Expands a branch's `lock_key` string (`table:pk1,pk2;...` tuples,
    /// comma-separated pks per table entry) into row keys.
    pub fn parse_lock_key(resource_id: &str, lock_key: &str) -> Vec<RowKey> {
        lock_key
            .split(';')
            .filter_map(|entry| {
                let (table, pks) = entry.split_once(':')?;
                Some((table.trim().to_string(), pks))
            })
            .flat_map(|(table, pks)| {
                let resource_id = resource_id.to_string();
                pks.split(',')
                    .map(move |pk| RowKey::new(&resource_id, &table, pk.trim()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize)]
#[getset(get = "pub")]
pub struct LockEntry {
    xid: String,
    branch_id: BranchId,
    acquired_at_ms: u64,
}

pub type LockManagerRef = Arc<LockManager>;

/// The coordinator's global lock table.
#[derive(Debug, Default)]
pub struct LockManager {
    entries: DashMap<RowKey, LockEntry>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> LockManagerRef {
        Arc::new(Self::new())
    }

    /// Single acquisition attempt for a full key set. Either every key ends
    /// up held by `xid` or none are newly taken: on conflict, keys taken in
    /// this attempt are released before returning the conflicting key.
    pub fn try_acquire(
        &self,
        row_keys: &[RowKey],
        xid: &str,
        branch_id: BranchId,
    ) -> Result<(), RowKey> {
        let mut newly_taken: Vec<&RowKey> = Vec::new();
        for key in row_keys {
            match self.entries.entry(key.clone()) {
                Entry::Occupied(held) => {
                    if held.get().xid != xid {
                        drop(held);
                        // keys this attempt inserted are rolled back; keys the
                        // xid already held from earlier branches stay
                        for key in newly_taken {
                            self.entries.remove(key);
                        }
                        return Err(key.clone());
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(LockEntry {
                        xid: xid.to_string(),
                        branch_id,
                        acquired_at_ms: now_ms(),
                    });
                    newly_taken.push(key);
                }
            }
        }
        Ok(())
    }

    /// Bounded retry around [`Self::try_acquire`]: sleeps a jittered
    /// `retry_interval_ms` between attempts, up to `max_retries`, then
    /// surfaces `LockConflict`.
    pub async fn acquire_with_retry(
        &self,
        row_keys: &[RowKey],
        xid: &str,
        branch_id: BranchId,
        config: &LockConfig,
    ) -> TxResult<()> {
        if row_keys.is_empty() {
            return Ok(());
        }
        let mut attempt = 0_u32;
        loop {
            match self.try_acquire(row_keys, xid, branch_id) {
                Ok(()) => {
                    trace!(xid, keys = row_keys.len(), "global locks acquired");
                    return Ok(());
                }
                Err(conflicting) if attempt >= *config.max_retries() => {
                    debug!(xid, key = %conflicting, attempt, "lock acquisition exhausted");
                    return Err(TxError::new(
                        ErrorKind::LockConflict,
                        format!("row {} held by another transaction", conflicting),
                    ));
                }
                Err(_) => {
                    attempt += 1;
                    let jitter: u64 = rand::thread_rng().gen_range(0..=*config.retry_interval_ms() / 2);
                    tokio::time::sleep(Duration::from_millis(
                        *config.retry_interval_ms() + jitter,
                    ))
                    .await;
                }
            }
        }
    }

    /// Releases every lock held by `xid`. Called strictly after all AT
    /// branches reached a phase-two-final state.
    pub fn release_xid(&self, xid: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.xid != xid);
        before - self.entries.len()
    }

    pub fn holder(&self, key: &RowKey) -> Option<LockEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn held_by(&self, xid: &str) -> Vec<RowKey> {
        self.entries
            .iter()
            .filter(|entry| entry.value().xid == xid)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
