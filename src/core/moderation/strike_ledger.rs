// Strike ledger - per-user violation counts and bounded history.
//
// Every read-modify-write of a record runs under the per-(guild, user) lock,
// so concurrent violations from one user never lose an increment.

use super::keyed_locks::KeyedLocks;
use super::moderation_models::{HistoryEntry, ViolationRecord};
use super::moderation_ports::{KeyValueStore, StoreError};
use std::sync::Arc;

pub const STRIKES_NAMESPACE: &str = "strikes";
/// Oldest history entries are dropped past this length.
pub const MAX_HISTORY_ENTRIES: usize = 20;

pub fn strike_key(guild_id: u64, user_id: u64) -> String {
    format!("{}_{}", guild_id, user_id)
}

pub struct StrikeLedger {
    store: Arc<dyn KeyValueStore>,
    locks: KeyedLocks<(u64, u64)>,
}

impl StrikeLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn violations(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<ViolationRecord>, StoreError> {
        match self
            .store
            .get(STRIKES_NAMESPACE, &strike_key(guild_id, user_id))
            .await?
        {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Scores of the newest `n` history entries, newest last.
    pub async fn recent_scores(
        &self,
        guild_id: u64,
        user_id: u64,
        n: usize,
    ) -> Result<Vec<f64>, StoreError> {
        let Some(record) = self.violations(guild_id, user_id).await? else {
            return Ok(Vec::new());
        };
        let skip = record.history.len().saturating_sub(n);
        Ok(record.history.iter().skip(skip).map(|h| h.score).collect())
    }

    /// Add one strike and one history entry. Returns the updated record.
    pub async fn record_violation(
        &self,
        guild_id: u64,
        user_id: u64,
        entry: HistoryEntry,
    ) -> Result<ViolationRecord, StoreError> {
        let _guard = self.locks.lock((guild_id, user_id)).await;

        let mut record = self
            .violations(guild_id, user_id)
            .await?
            .unwrap_or_else(|| ViolationRecord::new(guild_id, user_id));

        record.count = record.count.saturating_add(1);
        record.history.push(entry);
        if record.history.len() > MAX_HISTORY_ENTRIES {
            let excess = record.history.len() - MAX_HISTORY_ENTRIES;
            record.history.drain(..excess);
        }

        self.save(&record).await?;
        Ok(record)
    }

    /// Administrative reset. Returns the count that was cleared.
    pub async fn clear_strikes(&self, guild_id: u64, user_id: u64) -> Result<u32, StoreError> {
        let _guard = self.locks.lock((guild_id, user_id)).await;

        let cleared = self
            .violations(guild_id, user_id)
            .await?
            .map(|r| r.count)
            .unwrap_or(0);
        self.store
            .delete(STRIKES_NAMESPACE, &strike_key(guild_id, user_id))
            .await?;

        tracing::info!(guild_id, user_id, cleared, "Strikes cleared");
        Ok(cleared)
    }

    /// Administrative override of the strike count. History is kept.
    pub async fn set_strike_count(
        &self,
        guild_id: u64,
        user_id: u64,
        count: u32,
    ) -> Result<ViolationRecord, StoreError> {
        let _guard = self.locks.lock((guild_id, user_id)).await;

        let mut record = self
            .violations(guild_id, user_id)
            .await?
            .unwrap_or_else(|| ViolationRecord::new(guild_id, user_id));
        record.count = count;
        self.save(&record).await?;

        tracing::info!(guild_id, user_id, count, "Strike count set");
        Ok(record)
    }

    /// Every record of a guild, highest count first.
    pub async fn guild_records(&self, guild_id: u64) -> Result<Vec<ViolationRecord>, StoreError> {
        let prefix = format!("{}_", guild_id);
        let mut records = Vec::new();
        for (key, value) in self.store.all(STRIKES_NAMESPACE).await? {
            if key.starts_with(&prefix) {
                records.push(serde_json::from_value::<ViolationRecord>(value)?);
            }
        }
        records.sort_by(|a, b| b.count.cmp(&a.count).then(a.user_id.cmp(&b.user_id)));
        Ok(records)
    }

    /// Delete every record of a guild. Returns how many were removed.
    pub async fn purge_guild(&self, guild_id: u64) -> Result<usize, StoreError> {
        let prefix = format!("{}_", guild_id);
        let mut removed = 0;
        for (key, _) in self.store.all(STRIKES_NAMESPACE).await? {
            if key.starts_with(&prefix) && self.store.delete(STRIKES_NAMESPACE, &key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    async fn save(&self, record: &ViolationRecord) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        self.store
            .set(
                STRIKES_NAMESPACE,
                &strike_key(record.guild_id, record.user_id),
                value,
            )
            .await
    }
}
