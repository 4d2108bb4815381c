// Moderation domain models - data structures for the decision engine.
//
// These are pure domain types with no chat-platform dependencies.
// The integration layer converts verdicts into platform-specific actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of characters of message content kept in a history entry.
pub const HISTORY_SNIPPET_CHARS: usize = 100;

// ============================================================================
// INBOUND EVENTS
// ============================================================================

/// An attachment on an inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

/// A short-form text event handed to the engine by the integration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: u64,
    pub guild_id: u64,
    pub user_id: u64,
    pub channel_id: u64,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Messages authored by bots (including ourselves) are never moderated.
    #[serde(default)]
    pub author_is_bot: bool,
}

// ============================================================================
// SCORES & DETECTIONS
// ============================================================================

/// Categories returned by the external scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCategory {
    Toxicity,
    SevereToxicity,
    IdentityAttack,
    Insult,
    Profanity,
    Threat,
}

impl ScoreCategory {
    pub const ALL: [ScoreCategory; 6] = [
        ScoreCategory::Toxicity,
        ScoreCategory::SevereToxicity,
        ScoreCategory::IdentityAttack,
        ScoreCategory::Insult,
        ScoreCategory::Profanity,
        ScoreCategory::Threat,
    ];
}

impl std::fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreCategory::Toxicity => write!(f, "Toxicity"),
            ScoreCategory::SevereToxicity => write!(f, "Severe Toxicity"),
            ScoreCategory::IdentityAttack => write!(f, "Identity Attack"),
            ScoreCategory::Insult => write!(f, "Insult"),
            ScoreCategory::Profanity => write!(f, "Profanity"),
            ScoreCategory::Threat => write!(f, "Threat"),
        }
    }
}

/// Real-valued scores per category, each in [0, 1].
pub type CategoryScores = BTreeMap<ScoreCategory, f64>;

/// What kind of violation a detection stage found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "category")]
pub enum MatchedCategory {
    BlacklistedWord,
    Profanity,
    Threat,
    ExplicitContent,
    Scored(ScoreCategory),
}

impl std::fmt::Display for MatchedCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchedCategory::BlacklistedWord => write!(f, "Blacklisted Word"),
            MatchedCategory::Profanity => write!(f, "Profanity"),
            MatchedCategory::Threat => write!(f, "Threat"),
            MatchedCategory::ExplicitContent => write!(f, "Explicit Content"),
            MatchedCategory::Scored(category) => write!(f, "{}", category),
        }
    }
}

/// Output of a single pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub category: MatchedCategory,
    pub matched_signals: Vec<String>,
    pub confidence: f64,
    pub is_blocking: bool,
}

// ============================================================================
// BYPASS BUFFER
// ============================================================================

/// Identifies one bypass buffer: a user talking in one channel of one guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub guild_id: u64,
    pub user_id: u64,
    pub channel_id: u64,
}

/// A recent short message held for split-message detection.
#[derive(Debug, Clone)]
pub struct MessageFragment {
    pub text: String,
    pub word_count: usize,
    pub timestamp: DateTime<Utc>,
    pub origin_id: u64,
}

/// Toxic meaning found across several fragments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BypassMatch {
    pub combined_text: String,
    pub message_ids: Vec<u64>,
    pub message_count: usize,
    pub word_count: usize,
    /// Word overlap between the first two fragments, for diagnostics.
    pub similarity: f64,
}

// ============================================================================
// RATE LIMITING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Global,
    Guild,
    User,
}

impl std::fmt::Display for RateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateScope::Global => write!(f, "global"),
            RateScope::Guild => write!(f, "guild"),
            RateScope::User => write!(f, "user"),
        }
    }
}

/// Outcome of an admission check against a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub limited: bool,
    pub retry_after_secs: u64,
    /// Which window denied admission. `None` when admitted.
    pub scope: Option<RateScope>,
}

impl RateCheck {
    pub fn admitted() -> Self {
        Self {
            limited: false,
            retry_after_secs: 0,
            scope: None,
        }
    }

    pub fn limited(scope: RateScope, retry_after_secs: u64) -> Self {
        Self {
            limited: true,
            retry_after_secs,
            scope: Some(scope),
        }
    }
}

// ============================================================================
// STRIKES & PUNISHMENTS
// ============================================================================

/// One rung of the punishment ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunishmentKind {
    Warn,
    Timeout,
    Kick,
    Ban,
}

impl std::fmt::Display for PunishmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PunishmentKind::Warn => write!(f, "warn"),
            PunishmentKind::Timeout => write!(f, "timeout"),
            PunishmentKind::Kick => write!(f, "kick"),
            PunishmentKind::Ban => write!(f, "ban"),
        }
    }
}

impl std::str::FromStr for PunishmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn" => Ok(PunishmentKind::Warn),
            "timeout" | "mute" => Ok(PunishmentKind::Timeout),
            "kick" => Ok(PunishmentKind::Kick),
            "ban" => Ok(PunishmentKind::Ban),
            other => Err(format!("unknown punishment '{}'", other)),
        }
    }
}

/// The consequence chosen for a strike, ready to hand to the action executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPunishment {
    pub strike: u32,
    pub kind: PunishmentKind,
    /// Only set for timeouts.
    pub timeout_secs: Option<u64>,
}

/// One remembered violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(content: &str, score: f64, reason: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: content.chars().take(HISTORY_SNIPPET_CHARS).collect(),
            score,
            reason: reason.to_string(),
            timestamp,
        }
    }
}

/// Persisted strike counter and bounded violation history for a user in a guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub guild_id: u64,
    pub user_id: u64,
    pub count: u32,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl ViolationRecord {
    pub fn new(guild_id: u64, user_id: u64) -> Self {
        Self {
            guild_id,
            user_id,
            count: 0,
            history: Vec::new(),
        }
    }
}

/// Who a moderation action is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTarget {
    pub guild_id: u64,
    pub user_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
}

// ============================================================================
// VERDICT
// ============================================================================

/// Terminal state of the decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStage {
    WhitelistExit,
    BlacklistHit,
    ProfanityHit,
    ThreatHit,
    SafeContextExit,
    ExplicitHit,
    DeepContextExit,
    /// Scoring was skipped because a rate window was exhausted.
    Unscored,
    FastAllow,
    Scored,
}

/// How the analysed text was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Text,
    MultiLine,
    Attachment,
    MultiLineAttachment,
}

/// A URL the reputation collaborator considers suspicious.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkFlag {
    pub url: String,
    pub reason: String,
}

/// Degraded-mode notes attached to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "diagnostic", rename_all = "snake_case")]
pub enum Diagnostic {
    ScorerUnavailable { detail: String },
    RateLimiterExhausted { scope: RateScope, retry_after_secs: u64 },
    PersistenceWriteFailed { detail: String },
    PolicyUnavailable { detail: String },
    CollaboratorFailed { collaborator: String, detail: String },
}

/// The final decision for one message (or one dry-run evaluation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub message_id: Option<u64>,
    pub guild_id: u64,
    pub user_id: Option<u64>,
    pub blocked: bool,
    pub stage: VerdictStage,
    pub reason: String,
    pub matched_category: Option<MatchedCategory>,
    pub detection: Option<DetectionResult>,
    pub scores: CategoryScores,
    /// Maximum category score after the history multiplier and clamping.
    pub final_score: Option<f64>,
    pub threshold: f64,
    pub detection_method: DetectionMethod,
    pub bypass: Option<BypassMatch>,
    pub spam_burst: bool,
    pub link_flags: Vec<LinkFlag>,
    pub strike_count_after: Option<u32>,
    pub punishment_applied: Option<ResolvedPunishment>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Verdict {
    /// Score stored in the violation history for this verdict.
    pub fn history_score(&self) -> f64 {
        self.final_score
            .or_else(|| self.detection.as_ref().map(|d| d.confidence))
            .unwrap_or(1.0)
    }
}
