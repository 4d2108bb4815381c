// Collaborator interfaces ("ports") the decision engine depends on.
//
// The core defines WHAT it needs from storage, scoring, OCR, link reputation
// and the moderation-action executor. The infra layer provides the HOW.

use super::moderation_models::{ActionTarget, Attachment, CategoryScores, ResolvedPunishment};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("Scorer request failed: {0}")]
    Request(String),

    #[error("Scorer returned an unexpected response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
#[error("{collaborator} failed: {detail}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub detail: String,
}

impl CollaboratorError {
    pub fn new(collaborator: &'static str, detail: impl Into<String>) -> Self {
        Self {
            collaborator,
            detail: detail.into(),
        }
    }
}

/// Everything that can go wrong around a moderation run.
///
/// None of these abort message delivery: the engine turns them into
/// diagnostics on the verdict and, where persistence is involved, reports
/// them to the [`ErrorReporter`].
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Scorer unavailable: {0}")]
    ScorerUnavailable(String),

    #[error("Persistence write failed: {0}")]
    PersistenceWriteFailed(#[source] StoreError),

    #[error("Could not load guild policy: {0}")]
    PolicyUnavailable(#[source] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// PERSISTENCE (PORT)
// ============================================================================

/// Namespaced key-value persistence.
///
/// Used for guild policies, violation records and the error log.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StoreError>;

    async fn all(&self, namespace: &str) -> Result<Vec<(String, Value)>, StoreError>;
}

// ============================================================================
// SCORER (PORT)
// ============================================================================

/// External category scorer. Implementations that are switched off should
/// return 0 / an empty map rather than an error.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score_basic(&self, text: &str) -> Result<f64, ScorerError>;

    async fn score_detailed(&self, text: &str) -> Result<CategoryScores, ScorerError>;
}

// ============================================================================
// OPTIONAL INPUTS (PORTS)
// ============================================================================

/// Pulls text out of attachments (OCR).
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, attachment: &Attachment)
        -> Result<Option<String>, CollaboratorError>;
}

/// URL reputation lookup. `Ok(Some(reason))` marks the URL as suspicious.
#[async_trait]
pub trait LinkReputation: Send + Sync {
    async fn check_url(&self, url: &str) -> Result<Option<String>, CollaboratorError>;
}

// ============================================================================
// OUTPUTS (PORTS)
// ============================================================================

/// Carries out warn/timeout/kick/ban on the chat platform.
#[async_trait]
pub trait ModerationActions: Send + Sync {
    async fn apply(
        &self,
        target: &ActionTarget,
        punishment: &ResolvedPunishment,
        reason: &str,
    ) -> Result<(), CollaboratorError>;

    /// Post a notice in a channel. Only called while the outbound guard allows it.
    async fn notify(&self, channel_id: u64, notice: &str) -> Result<(), CollaboratorError>;
}

/// Receives non-fatal errors for later inspection.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, context: &str, error: &ModerationError, target: Option<ActionTarget>);
}

// ============================================================================
// WIRING
// ============================================================================

/// The collaborators handed to the policy engine.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub scorer: Arc<dyn Scorer>,
    pub actions: Arc<dyn ModerationActions>,
    pub error_reporter: Arc<dyn ErrorReporter>,
    pub text_extractor: Option<Arc<dyn TextExtractor>>,
    pub link_reputation: Option<Arc<dyn LinkReputation>>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        scorer: Arc<dyn Scorer>,
        actions: Arc<dyn ModerationActions>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            store,
            scorer,
            actions,
            error_reporter,
            text_extractor: None,
            link_reputation: None,
        }
    }

    pub fn with_text_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.text_extractor = Some(extractor);
        self
    }

    pub fn with_link_reputation(mut self, reputation: Arc<dyn LinkReputation>) -> Self {
        self.link_reputation = Some(reputation);
        self
    }
}
