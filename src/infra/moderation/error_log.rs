// Error reporter that keeps a capped log in the key-value store.

use crate::core::moderation::{ActionTarget, ErrorReporter, KeyValueStore, ModerationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ERRORS_NAMESPACE: &str = "errors";
pub const ERROR_LOG_KEY: &str = "error_log";
pub const DEFAULT_MAX_ERROR_LOG_ENTRIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub context: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub guild_id: Option<u64>,
    pub user_id: Option<u64>,
}

pub struct KvErrorReporter {
    store: Arc<dyn KeyValueStore>,
    max_entries: usize,
    // read-modify-write of the single log key
    write_lock: Mutex<()>,
}

impl KvErrorReporter {
    pub fn new(store: Arc<dyn KeyValueStore>, max_entries: usize) -> Self {
        Self {
            store,
            max_entries: max_entries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Newest last. An unreadable log reads as empty.
    pub async fn entries(&self) -> Vec<ErrorLogEntry> {
        match self.store.get(ERRORS_NAMESPACE, ERROR_LOG_KEY).await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read error log");
                Vec::new()
            }
        }
    }

    pub async fn clear(&self) -> bool {
        let _guard = self.write_lock.lock().await;
        self.store
            .delete(ERRORS_NAMESPACE, ERROR_LOG_KEY)
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl ErrorReporter for KvErrorReporter {
    async fn report(&self, context: &str, error: &ModerationError, target: Option<ActionTarget>) {
        tracing::error!(
            context,
            error = %error,
            guild_id = target.map(|t| t.guild_id),
            user_id = target.map(|t| t.user_id),
            "Moderation error"
        );

        let _guard = self.write_lock.lock().await;
        let mut entries = self.entries().await;
        entries.push(ErrorLogEntry {
            context: context.to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
            guild_id: target.map(|t| t.guild_id),
            user_id: target.map(|t| t.user_id),
        });
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }

        let value = match serde_json::to_value(&entries) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Could not serialize error log");
                return;
            }
        };
        // The reporter must never fail the caller.
        if let Err(e) = self.store.set(ERRORS_NAMESPACE, ERROR_LOG_KEY, value).await {
            tracing::warn!(error = %e, "Could not persist error log");
        }
    }
}
