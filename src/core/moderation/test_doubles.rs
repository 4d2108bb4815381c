// In-memory collaborator doubles shared by the moderation unit tests.

use super::moderation_models::{ActionTarget, Attachment, CategoryScores, ResolvedPunishment};
use super::moderation_ports::{
    CollaboratorError, ErrorReporter, KeyValueStore, LinkReputation, ModerationActions,
    ModerationError, Scorer, ScorerError, StoreError, TextExtractor,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockStore {
    data: DashMap<(String, String), Value>,
    pub fail_writes: AtomicBool,
}

#[async_trait]
impl KeyValueStore for MockStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        // Let other tasks run between a read and the write that follows it.
        tokio::task::yield_now().await;
        Ok(self
            .data
            .get(&(namespace.to_string(), key.to_string()))
            .map(|v| v.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.data
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .data
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .data
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect())
    }
}

/// Returns fixed scores; can be made slow or failing.
#[derive(Default)]
pub struct MockScorer {
    pub basic: Mutex<f64>,
    pub detailed: Mutex<CategoryScores>,
    pub delay: Mutex<Option<Duration>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl MockScorer {
    pub fn with_scores(basic: f64, detailed: CategoryScores) -> Self {
        Self {
            basic: Mutex::new(basic),
            detailed: Mutex::new(detailed),
            ..Default::default()
        }
    }

    async fn before_call(&self) -> Result<(), ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ScorerError::Request("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Scorer for MockScorer {
    async fn score_basic(&self, _text: &str) -> Result<f64, ScorerError> {
        self.before_call().await?;
        Ok(*self.basic.lock().unwrap())
    }

    async fn score_detailed(&self, _text: &str) -> Result<CategoryScores, ScorerError> {
        self.before_call().await?;
        Ok(self.detailed.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct RecordingActions {
    pub applied: Mutex<Vec<(ActionTarget, ResolvedPunishment)>>,
    pub notices: Mutex<Vec<(u64, String)>>,
}

#[async_trait]
impl ModerationActions for RecordingActions {
    async fn apply(
        &self,
        target: &ActionTarget,
        punishment: &ResolvedPunishment,
        _reason: &str,
    ) -> Result<(), CollaboratorError> {
        self.applied
            .lock()
            .unwrap()
            .push((*target, punishment.clone()));
        Ok(())
    }

    async fn notify(&self, channel_id: u64, notice: &str) -> Result<(), CollaboratorError> {
        self.notices
            .lock()
            .unwrap()
            .push((channel_id, notice.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<String>>,
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report(&self, context: &str, error: &ModerationError, _target: Option<ActionTarget>) {
        self.reports
            .lock()
            .unwrap()
            .push(format!("{}: {}", context, error));
    }
}

/// OCR double keyed by attachment URL.
#[derive(Default)]
pub struct MockExtractor {
    pub texts: DashMap<String, String>,
}

#[async_trait]
impl TextExtractor for MockExtractor {
    async fn extract_text(
        &self,
        attachment: &Attachment,
    ) -> Result<Option<String>, CollaboratorError> {
        Ok(self.texts.get(&attachment.url).map(|t| t.clone()))
    }
}

/// Flags every URL containing one of `bad_fragments`.
#[derive(Default)]
pub struct MockReputation {
    pub bad_fragments: Vec<String>,
}

#[async_trait]
impl LinkReputation for MockReputation {
    async fn check_url(&self, url: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self
            .bad_fragments
            .iter()
            .find(|f| url.contains(f.as_str()))
            .map(|_| "known phishing domain".to_string()))
    }
}
