// Policy engine - turns one inbound message into a verdict.
//
// Pipeline, first match wins:
//   whitelist -> blacklist -> profanity -> threat / safe context -> explicit
//   -> deep context -> rate limit -> basic score -> detailed score
//
// Every stateful tracker (rate windows, bypass buffers, spam counters, the
// de-duplication sets) is owned by one engine instance. Nothing here is
// process-global.

use super::bypass_buffer::{BypassBuffer, MAX_FRAGMENT_WORDS};
use super::dedup::MessageDeduplicator;
use super::moderation_models::{
    ActionTarget, BufferKey, CategoryScores, DetectionMethod, DetectionResult, Diagnostic,
    HistoryEntry, InboundMessage, LinkFlag, MatchedCategory, PunishmentKind, RateScope,
    ScoreCategory, VerdictStage, Verdict, ViolationRecord,
};
use super::moderation_ports::{
    CollaboratorError, Collaborators, ModerationError, ScorerError, StoreError,
};
use super::pattern_detectors::{
    check_blacklist, contains_whitelisted, requires_context_analysis, topic_markers,
    ExplicitContentDetector, ProfanityDetector, ThreatConfidence, ThreatDetector,
};
use super::policy_config::{GuildPolicy, GuildPolicyOverrides, GuildPolicyRepository, WordList};
use super::punishment::PunishmentLadder;
use super::rate_limiter::{RateLimiter, RateLimits};
use super::spam_guard::SpamGuard;
use super::strike_ledger::StrikeLedger;
use super::text_normalizer::{normalize, normalized_word_count};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::time::Duration;

/// Basic scores below `threshold * FAST_ALLOW_RATIO` skip detailed scoring.
pub const FAST_ALLOW_RATIO: f64 = 0.8;
pub const HISTORY_MULTIPLIER: f64 = 1.2;
const HISTORY_LOOKBACK: usize = 3;
const HISTORY_TRIGGER_RATIO: f64 = 0.7;
const HISTORY_TRIGGER_COUNT: usize = 2;

static RE_URL: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).ok());

// ============================================================================
// CONFIG
// ============================================================================

/// Process-level knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub rate_limits: RateLimits,
    /// Deadline for every collaborator call.
    pub collaborator_timeout: Duration,
    pub dedup_ttl: chrono::Duration,
    pub buffer_window: chrono::Duration,
    pub buffer_max_fragments: usize,
    pub outbound_limit: u32,
    pub outbound_window: chrono::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimits::default(),
            collaborator_timeout: Duration::from_millis(5_000),
            dedup_ttl: chrono::Duration::seconds(super::dedup::DEFAULT_DEDUP_TTL_SECS),
            buffer_window: chrono::Duration::milliseconds(
                super::bypass_buffer::DEFAULT_BUFFER_WINDOW_MS,
            ),
            buffer_max_fragments: super::bypass_buffer::DEFAULT_MAX_FRAGMENTS,
            outbound_limit: super::spam_guard::DEFAULT_OUTBOUND_LIMIT,
            outbound_window: chrono::Duration::milliseconds(
                super::spam_guard::DEFAULT_OUTBOUND_WINDOW_MS,
            ),
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rate_windows: usize,
    pub bypass_buffers: usize,
    pub spam_windows: usize,
    pub processed_ids: usize,
    pub idle_locks: usize,
}

// ============================================================================
// DECISION
// ============================================================================

/// Outcome of the detection pipeline before side effects.
#[derive(Debug)]
struct Decision {
    stage: VerdictStage,
    blocked: bool,
    reason: String,
    matched_category: Option<MatchedCategory>,
    detection: Option<DetectionResult>,
    scores: CategoryScores,
    final_score: Option<f64>,
}

impl Decision {
    fn allow(stage: VerdictStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            blocked: false,
            reason: reason.into(),
            matched_category: None,
            detection: None,
            scores: CategoryScores::new(),
            final_score: None,
        }
    }

    fn block(
        stage: VerdictStage,
        category: MatchedCategory,
        signals: Vec<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            blocked: true,
            reason: reason.into(),
            matched_category: Some(category),
            detection: Some(DetectionResult {
                category,
                matched_signals: signals,
                confidence,
                is_blocking: true,
            }),
            scores: CategoryScores::new(),
            final_score: None,
        }
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct PolicyEngine {
    collaborators: Collaborators,
    policies: GuildPolicyRepository,
    ledger: StrikeLedger,
    rate_limiter: RateLimiter,
    spam_guard: SpamGuard,
    bypass: BypassBuffer,
    dedup: MessageDeduplicator,
    collaborator_timeout: Duration,
}

impl PolicyEngine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        Self {
            policies: GuildPolicyRepository::new(collaborators.store.clone()),
            ledger: StrikeLedger::new(collaborators.store.clone()),
            rate_limiter: RateLimiter::new(config.rate_limits),
            spam_guard: SpamGuard::new(config.outbound_limit, config.outbound_window),
            bypass: BypassBuffer::new(config.buffer_window, config.buffer_max_fragments),
            dedup: MessageDeduplicator::new(config.dedup_ttl),
            collaborator_timeout: config.collaborator_timeout,
            collaborators,
        }
    }

    /// Moderate one live message.
    ///
    /// Returns `None` when the message is not moderated at all: bot authors,
    /// duplicate deliveries, disabled guilds, exempt users and messages with
    /// nothing to analyse. Collaborator failures never abort the run; they
    /// show up as diagnostics on the verdict.
    pub async fn process(&self, message: &InboundMessage) -> Option<Verdict> {
        if message.author_is_bot {
            return None;
        }

        let now = Utc::now();
        let Some(_claim) = self.dedup.try_begin(message.message_id, now) else {
            tracing::debug!(message_id = message.message_id, "Duplicate delivery ignored");
            return None;
        };

        let mut diagnostics = Vec::new();
        let policy = self.load_policy(message.guild_id, &mut diagnostics).await;
        if !policy.enabled || policy.is_exempt(message.user_id) {
            return None;
        }

        let spam_burst = policy.spam_protection
            && self.spam_guard.is_user_burst(
                message.guild_id,
                message.user_id,
                policy.spam_max_messages,
                chrono::Duration::milliseconds(policy.spam_window_ms as i64),
                now,
            );
        if spam_burst {
            tracing::warn!(
                guild_id = message.guild_id,
                user_id = message.user_id,
                "Message burst detected"
            );
        }

        let key = BufferKey {
            guild_id: message.guild_id,
            user_id: message.user_id,
            channel_id: message.channel_id,
        };
        let mut text = message.content.clone();
        let mut method = DetectionMethod::Text;
        let mut bypass = None;

        if policy.anti_bypass {
            let words = normalized_word_count(&message.content);
            if words > MAX_FRAGMENT_WORDS {
                self.bypass.clear(key);
            } else if words > 0 {
                self.bypass
                    .add(key, &message.content, message.message_id, now);
                if let Some(found) = self.bypass.take_match(key, now) {
                    text = found.combined_text.clone();
                    method = DetectionMethod::MultiLine;
                    bypass = Some(found);
                }
            }
        }

        if policy.image_detection {
            if let Some(extracted) = self.attachment_text(message, &mut diagnostics).await {
                text.push(' ');
                text.push_str(&extracted);
                method = match method {
                    DetectionMethod::MultiLine => DetectionMethod::MultiLineAttachment,
                    _ => DetectionMethod::Attachment,
                };
            }
        }

        if text.trim().is_empty() {
            return None;
        }

        let link_flags = if policy.link_protection {
            self.link_flags(&message.content, &mut diagnostics).await
        } else {
            Vec::new()
        };

        let decision = self
            .decide(
                message.guild_id,
                Some(message.user_id),
                &text,
                &policy,
                &mut diagnostics,
            )
            .await;

        // A match was already consumed by `take_match`; a benign-context exit
        // empties the buffer as well.
        if matches!(
            decision.stage,
            VerdictStage::WhitelistExit | VerdictStage::SafeContextExit | VerdictStage::DeepContextExit
        ) {
            self.bypass.clear(key);
        }

        let mut verdict = Verdict {
            message_id: Some(message.message_id),
            guild_id: message.guild_id,
            user_id: Some(message.user_id),
            blocked: decision.blocked,
            stage: decision.stage,
            reason: decision.reason,
            matched_category: decision.matched_category,
            detection: decision.detection,
            scores: decision.scores,
            final_score: decision.final_score,
            threshold: policy.threshold,
            detection_method: method,
            bypass,
            spam_burst,
            link_flags,
            strike_count_after: None,
            punishment_applied: None,
            diagnostics: Vec::new(),
        };

        if verdict.blocked {
            self.enforce(message, &policy, &mut verdict, &mut diagnostics, now)
                .await;
        }

        verdict.diagnostics = diagnostics;
        Some(verdict)
    }

    /// Dry run of the decision pipeline over `text`.
    ///
    /// Consumes no rate quota, touches no bypass buffer, records no strike,
    /// applies no punishment and ignores the guild's `enabled` switch.
    pub async fn evaluate(&self, guild_id: u64, text: &str) -> Verdict {
        let mut diagnostics = Vec::new();
        let policy = self.load_policy(guild_id, &mut diagnostics).await;
        let decision = self
            .decide(guild_id, None, text, &policy, &mut diagnostics)
            .await;

        Verdict {
            message_id: None,
            guild_id,
            user_id: None,
            blocked: decision.blocked,
            stage: decision.stage,
            reason: decision.reason,
            matched_category: decision.matched_category,
            detection: decision.detection,
            scores: decision.scores,
            final_score: decision.final_score,
            threshold: policy.threshold,
            detection_method: DetectionMethod::Text,
            bypass: None,
            spam_burst: false,
            link_flags: Vec::new(),
            strike_count_after: None,
            punishment_applied: None,
            diagnostics,
        }
    }

    /// The detection state machine. `live_user` is `None` for dry runs.
    async fn decide(
        &self,
        guild_id: u64,
        live_user: Option<u64>,
        text: &str,
        policy: &GuildPolicy,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Decision {
        let normalized = normalize(text);

        if contains_whitelisted(&normalized, &policy.whitelist_words) {
            return Decision::allow(VerdictStage::WhitelistExit, "Contains whitelisted word");
        }

        let blacklist = check_blacklist(&normalized, &policy.blacklist_words);
        if blacklist.found {
            return Decision::block(
                VerdictStage::BlacklistHit,
                MatchedCategory::BlacklistedWord,
                blacklist.matches,
                1.0,
                "Blacklisted word",
            );
        }

        let profanity = ProfanityDetector::check(&normalized);
        if profanity.found {
            return Decision::block(
                VerdictStage::ProfanityHit,
                MatchedCategory::Profanity,
                profanity.matches,
                0.9,
                "Profanity",
            );
        }

        let threat = ThreatDetector::check(text);
        match threat.confidence {
            ThreatConfidence::High => {
                return Decision::block(
                    VerdictStage::ThreatHit,
                    MatchedCategory::Threat,
                    threat.patterns,
                    0.95,
                    "Threatening language",
                );
            }
            ThreatConfidence::SafeContext => {
                return Decision::allow(VerdictStage::SafeContextExit, "Safe context");
            }
            ThreatConfidence::None => {}
        }

        let explicit = ExplicitContentDetector::check(&normalized);
        if explicit.found {
            return Decision::block(
                VerdictStage::ExplicitHit,
                MatchedCategory::ExplicitContent,
                explicit.matches,
                0.9,
                "Explicit content",
            );
        }

        if policy.deep_context_analysis && requires_context_analysis(&normalized) {
            let topics = topic_markers(&normalized);
            if !topics.is_empty() {
                return Decision::allow(
                    VerdictStage::DeepContextExit,
                    format!("Topic context: {}", topics.join(", ")),
                );
            }
        }

        if let Some(user_id) = live_user {
            let check =
                self.rate_limiter
                    .check_all_at(guild_id, policy.guild_rate_limit, user_id, Utc::now());
            if check.limited {
                let scope = check.scope.unwrap_or(RateScope::Global);
                tracing::warn!(
                    guild_id,
                    user_id,
                    %scope,
                    retry_after_secs = check.retry_after_secs,
                    "Rate limit reached, skipping scoring"
                );
                diagnostics.push(Diagnostic::RateLimiterExhausted {
                    scope,
                    retry_after_secs: check.retry_after_secs,
                });
                return Decision::allow(VerdictStage::Unscored, "Rate limited, scoring skipped");
            }
        }

        let scorer = &self.collaborators.scorer;
        let basic = match self.scorer_call(scorer.score_basic(&normalized)).await {
            Ok(score) => clamp_score(score),
            Err(e) => return Self::unscored(guild_id, e, diagnostics),
        };

        if basic < policy.threshold * FAST_ALLOW_RATIO {
            let mut decision = Decision::allow(VerdictStage::FastAllow, "Below threshold");
            decision.scores.insert(ScoreCategory::Toxicity, basic);
            decision.final_score = Some(basic);
            return decision;
        }

        let scores: CategoryScores = match self.scorer_call(scorer.score_detailed(&normalized)).await
        {
            Ok(scores) => scores
                .into_iter()
                .map(|(category, score)| (category, clamp_score(score)))
                .collect(),
            Err(e) => return Self::unscored(guild_id, e, diagnostics),
        };

        let multiplier = match live_user {
            Some(user_id) if policy.context_analysis => {
                self.history_multiplier(guild_id, user_id, policy).await
            }
            _ => 1.0,
        };

        let adjusted: Vec<(ScoreCategory, f64)> = scores
            .iter()
            .map(|(category, score)| (*category, clamp_score(score * multiplier)))
            .collect();

        let final_score = adjusted.iter().map(|(_, s)| *s).max_by(f64::total_cmp);

        let exceeded: Vec<(ScoreCategory, f64)> = adjusted
            .iter()
            .copied()
            .filter(|(category, score)| *score > policy.threshold_for(*category))
            .collect();

        let worst = exceeded
            .iter()
            .copied()
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let mut decision = match worst {
            Some((category, score)) => {
                let signals = exceeded.iter().map(|(c, _)| c.to_string()).collect();
                Decision::block(
                    VerdictStage::Scored,
                    MatchedCategory::Scored(category),
                    signals,
                    score,
                    format!(
                        "{} score {:.2} exceeds threshold {:.2}",
                        category,
                        score,
                        policy.threshold_for(category)
                    ),
                )
            }
            None => Decision::allow(VerdictStage::Scored, "Below threshold"),
        };
        decision.scores = scores;
        decision.final_score = final_score;
        decision
    }

    /// ×1.2 when at least two of the last three violations were close to the
    /// threshold. Fewer than three recorded violations never trigger it.
    async fn history_multiplier(&self, guild_id: u64, user_id: u64, policy: &GuildPolicy) -> f64 {
        match self
            .ledger
            .recent_scores(guild_id, user_id, HISTORY_LOOKBACK)
            .await
        {
            Ok(recent) if recent.len() < HISTORY_LOOKBACK => 1.0,
            Ok(recent) => {
                let cutoff = policy.threshold * HISTORY_TRIGGER_RATIO;
                let hot = recent.iter().filter(|score| **score > cutoff).count();
                if hot >= HISTORY_TRIGGER_COUNT {
                    HISTORY_MULTIPLIER
                } else {
                    1.0
                }
            }
            Err(e) => {
                tracing::warn!(guild_id, user_id, error = %e, "Could not read history, no multiplier");
                1.0
            }
        }
    }

    fn unscored(
        guild_id: u64,
        error: ModerationError,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Decision {
        tracing::warn!(guild_id, error = %error, "Scorer unavailable, allowing message");
        let detail = match error {
            ModerationError::ScorerUnavailable(detail) => detail,
            other => other.to_string(),
        };
        diagnostics.push(Diagnostic::ScorerUnavailable { detail });
        Decision::allow(VerdictStage::Unscored, "Scorer unavailable")
    }

    /// Record the strike, resolve and apply the punishment, post a notice.
    async fn enforce(
        &self,
        message: &InboundMessage,
        policy: &GuildPolicy,
        verdict: &mut Verdict,
        diagnostics: &mut Vec<Diagnostic>,
        now: DateTime<Utc>,
    ) {
        let target = ActionTarget {
            guild_id: message.guild_id,
            user_id: message.user_id,
            channel_id: message.channel_id,
            message_id: message.message_id,
        };

        tracing::info!(
            guild_id = message.guild_id,
            user_id = message.user_id,
            message_id = message.message_id,
            stage = ?verdict.stage,
            reason = %verdict.reason,
            "Message blocked"
        );

        let entry = HistoryEntry::new(&message.content, verdict.history_score(), &verdict.reason, now);
        let record = match self
            .ledger
            .record_violation(message.guild_id, message.user_id, entry)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    guild_id = message.guild_id,
                    user_id = message.user_id,
                    error = %e,
                    "Failed to record violation"
                );
                diagnostics.push(Diagnostic::PersistenceWriteFailed {
                    detail: e.to_string(),
                });
                self.collaborators
                    .error_reporter
                    .report(
                        "strike_ledger",
                        &ModerationError::PersistenceWriteFailed(e),
                        Some(target),
                    )
                    .await;
                return;
            }
        };
        verdict.strike_count_after = Some(record.count);

        let punishment = PunishmentLadder::resolve(record.count, policy);
        let reason = format!("{} (strike {})", verdict.reason, record.count);
        match self
            .with_deadline(
                "moderation_actions",
                self.collaborators.actions.apply(&target, &punishment, &reason),
            )
            .await
        {
            Ok(()) => verdict.punishment_applied = Some(punishment.clone()),
            Err(e) => self.collaborator_failed(e, Some(target), diagnostics).await,
        }

        if self.spam_guard.allow_outbound(message.channel_id, now) {
            let notice = Self::notice(message.user_id, &verdict.reason, record.count, punishment.kind);
            if let Err(e) = self
                .with_deadline(
                    "moderation_actions",
                    self.collaborators.actions.notify(message.channel_id, &notice),
                )
                .await
            {
                self.collaborator_failed(e, Some(target), diagnostics).await;
            }
        }
    }

    fn notice(user_id: u64, reason: &str, strike: u32, kind: PunishmentKind) -> String {
        format!(
            "A message from user {} was removed: {}. Strike {} ({}).",
            user_id, reason, strike, kind
        )
    }

    // ========================================================================
    // COLLABORATOR CALLS
    // ========================================================================

    async fn load_policy(&self, guild_id: u64, diagnostics: &mut Vec<Diagnostic>) -> GuildPolicy {
        match self.policies.load(guild_id).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::warn!(guild_id, error = %e, "Could not load guild policy, using defaults");
                diagnostics.push(Diagnostic::PolicyUnavailable {
                    detail: e.to_string(),
                });
                GuildPolicy::default()
            }
        }
    }

    /// OCR text of every image attachment, joined. `None` if nothing was found.
    async fn attachment_text(
        &self,
        message: &InboundMessage,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<String> {
        let extractor = self.collaborators.text_extractor.as_ref()?;
        let mut parts = Vec::new();

        for attachment in message.attachments.iter().filter(|a| a.is_image()) {
            match self
                .with_deadline("text_extractor", extractor.extract_text(attachment))
                .await
            {
                Ok(Some(found)) if !found.trim().is_empty() => parts.push(found),
                Ok(_) => {}
                Err(e) => self.collaborator_failed(e, None, diagnostics).await,
            }
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    async fn link_flags(&self, content: &str, diagnostics: &mut Vec<Diagnostic>) -> Vec<LinkFlag> {
        let (Some(reputation), Some(url_re)) =
            (self.collaborators.link_reputation.as_ref(), RE_URL.as_ref())
        else {
            return Vec::new();
        };

        let mut urls: Vec<&str> = url_re.find_iter(content).map(|m| m.as_str()).collect();
        urls.sort_unstable();
        urls.dedup();

        let mut flags = Vec::new();
        for url in urls {
            match self
                .with_deadline("link_reputation", reputation.check_url(url))
                .await
            {
                Ok(Some(reason)) => flags.push(LinkFlag {
                    url: url.to_string(),
                    reason,
                }),
                Ok(None) => {}
                Err(e) => self.collaborator_failed(e, None, diagnostics).await,
            }
        }
        flags
    }

    async fn scorer_call<T, F>(&self, call: F) -> Result<T, ModerationError>
    where
        F: Future<Output = Result<T, ScorerError>>,
    {
        match tokio::time::timeout(self.collaborator_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ModerationError::ScorerUnavailable(e.to_string())),
            Err(_) => Err(ModerationError::ScorerUnavailable(format!(
                "timed out after {}ms",
                self.collaborator_timeout.as_millis()
            ))),
        }
    }

    async fn with_deadline<T, F>(
        &self,
        collaborator: &'static str,
        call: F,
    ) -> Result<T, CollaboratorError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        match tokio::time::timeout(self.collaborator_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::new(
                collaborator,
                format!("timed out after {}ms", self.collaborator_timeout.as_millis()),
            )),
        }
    }

    async fn collaborator_failed(
        &self,
        error: CollaboratorError,
        target: Option<ActionTarget>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        tracing::warn!(collaborator = error.collaborator, detail = %error.detail, "Collaborator call failed");
        diagnostics.push(Diagnostic::CollaboratorFailed {
            collaborator: error.collaborator.to_string(),
            detail: error.detail.clone(),
        });
        if target.is_some() {
            self.collaborators
                .error_reporter
                .report("moderation_actions", &ModerationError::Collaborator(error), target)
                .await;
        }
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    pub async fn policy(&self, guild_id: u64) -> Result<GuildPolicy, StoreError> {
        self.policies.load(guild_id).await
    }

    pub async fn update_policy(
        &self,
        guild_id: u64,
        changes: GuildPolicyOverrides,
    ) -> Result<GuildPolicy, ModerationError> {
        self.policies.update(guild_id, changes).await
    }

    pub async fn set_sensitivity(
        &self,
        guild_id: u64,
        level: u8,
    ) -> Result<GuildPolicy, ModerationError> {
        self.policies.set_sensitivity(guild_id, level).await
    }

    pub async fn set_punishment(
        &self,
        guild_id: u64,
        strike: u32,
        kind: PunishmentKind,
    ) -> Result<GuildPolicy, ModerationError> {
        self.policies.set_punishment(guild_id, strike, kind).await
    }

    pub async fn set_timeout_duration(
        &self,
        guild_id: u64,
        strike: u32,
        duration: &str,
    ) -> Result<GuildPolicy, ModerationError> {
        self.policies
            .set_timeout_duration(guild_id, strike, duration)
            .await
    }

    pub async fn add_word(
        &self,
        guild_id: u64,
        list: WordList,
        word: &str,
    ) -> Result<bool, ModerationError> {
        self.policies.add_word(guild_id, list, word).await
    }

    pub async fn remove_word(
        &self,
        guild_id: u64,
        list: WordList,
        word: &str,
    ) -> Result<bool, ModerationError> {
        self.policies.remove_word(guild_id, list, word).await
    }

    pub async fn violations(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<ViolationRecord>, StoreError> {
        self.ledger.violations(guild_id, user_id).await
    }

    pub async fn guild_violations(&self, guild_id: u64) -> Result<Vec<ViolationRecord>, StoreError> {
        self.ledger.guild_records(guild_id).await
    }

    pub async fn clear_strikes(&self, guild_id: u64, user_id: u64) -> Result<u32, StoreError> {
        self.ledger.clear_strikes(guild_id, user_id).await
    }

    pub async fn set_strike_count(
        &self,
        guild_id: u64,
        user_id: u64,
        count: u32,
    ) -> Result<ViolationRecord, StoreError> {
        self.ledger.set_strike_count(guild_id, user_id, count).await
    }

    /// Remove everything stored for a guild: policy, strike records and
    /// in-memory bypass buffers. Returns the number of strike records removed.
    pub async fn purge_guild(&self, guild_id: u64) -> Result<usize, ModerationError> {
        let removed = self
            .ledger
            .purge_guild(guild_id)
            .await
            .map_err(ModerationError::PersistenceWriteFailed)?;
        self.policies.reset(guild_id).await?;
        self.bypass.clear_guild(guild_id);

        tracing::info!(guild_id, removed, "Guild data purged");
        Ok(removed)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Prune every in-memory tracker. Each structure only holds its own
    /// shard locks briefly while retaining.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            rate_windows: self.rate_limiter.sweep(now),
            bypass_buffers: self.bypass.sweep(now),
            spam_windows: self.spam_guard.sweep(now),
            processed_ids: self.dedup.sweep(now),
            idle_locks: self.ledger.prune_locks() + self.policies.prune_locks(),
        };
        tracing::debug!(?report, "Sweep finished");
        report
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::moderation_models::Attachment;
    use crate::core::moderation::test_doubles::{
        MockExtractor, MockReputation, MockScorer, MockStore, RecordingActions, RecordingReporter,
    };
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    struct Harness {
        engine: PolicyEngine,
        store: Arc<MockStore>,
        scorer: Arc<MockScorer>,
        actions: Arc<RecordingActions>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness_with(config: EngineConfig, scorer: MockScorer) -> Harness {
        let store = Arc::new(MockStore::default());
        let scorer = Arc::new(scorer);
        let actions = Arc::new(RecordingActions::default());
        let reporter = Arc::new(RecordingReporter::default());
        let collaborators = Collaborators::new(
            store.clone(),
            scorer.clone(),
            actions.clone(),
            reporter.clone(),
        );
        Harness {
            engine: PolicyEngine::new(config, collaborators),
            store,
            scorer,
            actions,
            reporter,
        }
    }

    fn harness(basic: f64, detailed: &[(ScoreCategory, f64)]) -> Harness {
        harness_with(
            EngineConfig::default(),
            MockScorer::with_scores(basic, detailed.iter().copied().collect()),
        )
    }

    fn message(id: u64, content: &str) -> InboundMessage {
        InboundMessage {
            message_id: id,
            guild_id: 1,
            user_id: 2,
            channel_id: 3,
            content: content.to_string(),
            attachments: Vec::new(),
            author_is_bot: false,
        }
    }

    const KEY: BufferKey = BufferKey {
        guild_id: 1,
        user_id: 2,
        channel_id: 3,
    };

    #[tokio::test]
    async fn test_whitelist_takes_precedence_over_blacklist() {
        let h = harness(0.0, &[]);
        h.engine
            .add_word(1, WordList::Blacklist, "kill")
            .await
            .unwrap();
        h.engine
            .add_word(1, WordList::Whitelist, "kill it")
            .await
            .unwrap();

        let verdict = h
            .engine
            .process(&message(10, "you will kill it tonight"))
            .await
            .unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::WhitelistExit);

        let verdict = h.engine.process(&message(11, "kill the lights")).await.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::BlacklistHit);
    }

    #[tokio::test]
    async fn test_blacklist_blocks_without_scoring() {
        let h = harness(0.0, &[]);
        h.engine
            .add_word(1, WordList::Blacklist, "banana")
            .await
            .unwrap();

        let verdict = h.engine.process(&message(10, "B4NANA time")).await.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.matched_category, Some(MatchedCategory::BlacklistedWord));
        assert_eq!(verdict.strike_count_after, Some(1));
        assert_eq!(
            verdict.punishment_applied.as_ref().map(|p| p.kind),
            Some(PunishmentKind::Warn)
        );
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.actions.applied.lock().unwrap().len(), 1);
        assert_eq!(h.actions.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_threat_blocks_and_safe_context_allows() {
        let h = harness(0.0, &[]);

        let threat = h.engine.process(&message(10, "I'll kill you")).await.unwrap();
        assert!(threat.blocked);
        assert_eq!(threat.stage, VerdictStage::ThreatHit);

        let shouted = h.engine.process(&message(12, "I'll kill you!")).await.unwrap();
        assert!(shouted.blocked);
        assert_eq!(shouted.stage, VerdictStage::ThreatHit);

        let gaming = h
            .engine
            .process(&message(11, "I'll kill you in the game tonight"))
            .await
            .unwrap();
        assert!(!gaming.blocked);
        assert_eq!(gaming.stage, VerdictStage::SafeContextExit);
    }

    #[tokio::test]
    async fn test_deep_context_allows_topic_talk() {
        let h = harness(0.9, &[(ScoreCategory::Toxicity, 0.9)]);
        let verdict = h
            .engine
            .process(&message(10, "that boss fight was killing me"))
            .await
            .unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::DeepContextExit);
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fast_allow_skips_detailed_scoring() {
        let h = harness(0.1, &[(ScoreCategory::Toxicity, 0.99)]);
        let verdict = h.engine.process(&message(10, "have a nice day")).await.unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::FastAllow);
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detailed_score_above_threshold_blocks() {
        let h = harness(
            0.9,
            &[(ScoreCategory::Toxicity, 0.5), (ScoreCategory::Insult, 0.85)],
        );
        let verdict = h
            .engine
            .process(&message(10, "you are a terrible person"))
            .await
            .unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::Scored);
        assert_eq!(
            verdict.matched_category,
            Some(MatchedCategory::Scored(ScoreCategory::Insult))
        );
        assert_eq!(verdict.final_score, Some(0.85));
    }

    #[tokio::test]
    async fn test_category_threshold_overrides_global() {
        let h = harness(0.9, &[(ScoreCategory::Threat, 0.7)]);
        let mut thresholds = std::collections::BTreeMap::new();
        thresholds.insert(ScoreCategory::Threat, 0.6);
        h.engine
            .update_policy(
                1,
                GuildPolicyOverrides {
                    threshold: Some(0.8),
                    category_thresholds: Some(thresholds),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let verdict = h
            .engine
            .process(&message(10, "you had better be careful"))
            .await
            .unwrap();
        assert!(verdict.blocked);
        assert_eq!(
            verdict.matched_category,
            Some(MatchedCategory::Scored(ScoreCategory::Threat))
        );
    }

    #[tokio::test]
    async fn test_history_multiplier_is_clamped() {
        let h = harness(0.95, &[(ScoreCategory::Toxicity, 0.95)]);
        for _ in 0..3 {
            h.engine
                .ledger
                .record_violation(1, 2, HistoryEntry::new("earlier", 0.9, "test", Utc::now()))
                .await
                .unwrap();
        }

        let verdict = h
            .engine
            .process(&message(10, "you are a terrible person"))
            .await
            .unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.final_score, Some(1.0));
        assert_eq!(verdict.scores.get(&ScoreCategory::Toxicity), Some(&0.95));
        assert_eq!(verdict.strike_count_after, Some(4));
    }

    #[tokio::test]
    async fn test_two_hot_entries_are_not_enough_history() {
        let h = harness(0.7, &[(ScoreCategory::Toxicity, 0.7)]);
        for _ in 0..2 {
            h.engine
                .ledger
                .record_violation(1, 2, HistoryEntry::new("earlier", 0.9, "test", Utc::now()))
                .await
                .unwrap();
        }

        let verdict = h
            .engine
            .process(&message(10, "you are a terrible person"))
            .await
            .unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.final_score, Some(0.7));
        assert_eq!(h.engine.violations(1, 2).await.unwrap().map(|r| r.count), Some(2));
    }

    #[tokio::test]
    async fn test_no_multiplier_without_history() {
        let h = harness(0.95, &[(ScoreCategory::Toxicity, 0.95)]);
        let verdict = h
            .engine
            .process(&message(10, "you are a terrible person"))
            .await
            .unwrap();
        assert_eq!(verdict.final_score, Some(0.95));
    }

    #[tokio::test]
    async fn test_rate_limited_message_is_unscored() {
        let config = EngineConfig {
            rate_limits: RateLimits {
                per_user: 1,
                ..RateLimits::default()
            },
            ..EngineConfig::default()
        };
        let h = harness_with(config, MockScorer::with_scores(0.1, Default::default()));

        let first = h.engine.process(&message(10, "hello there")).await.unwrap();
        assert_eq!(first.stage, VerdictStage::FastAllow);

        let second = h.engine.process(&message(11, "hello again")).await.unwrap();
        assert!(!second.blocked);
        assert_eq!(second.stage, VerdictStage::Unscored);
        assert!(matches!(
            second.diagnostics.as_slice(),
            [Diagnostic::RateLimiterExhausted {
                scope: RateScope::User,
                ..
            }]
        ));
        assert_eq!(h.scorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scorer_timeout_fails_open() {
        let config = EngineConfig {
            collaborator_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let scorer = MockScorer::with_scores(0.99, Default::default());
        *scorer.delay.lock().unwrap() = Some(Duration::from_millis(500));
        let h = harness_with(config, scorer);

        let verdict = h
            .engine
            .process(&message(10, "you are a terrible person"))
            .await
            .unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::Unscored);
        assert!(matches!(
            verdict.diagnostics.as_slice(),
            [Diagnostic::ScorerUnavailable { .. }]
        ));
    }

    #[tokio::test]
    async fn test_scorer_error_fails_open() {
        let h = harness(0.99, &[]);
        h.scorer.fail.store(true, Ordering::SeqCst);
        let verdict = h.engine.process(&message(10, "whatever")).await.unwrap();
        assert!(!verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::Unscored);
    }

    #[tokio::test]
    async fn test_split_message_is_caught_and_buffer_cleared() {
        let h = harness(0.0, &[]);

        let first = h.engine.process(&message(10, "kill")).await.unwrap();
        assert!(!first.blocked);
        assert_eq!(h.engine.bypass.len(KEY), 1);

        let second = h.engine.process(&message(11, "yourself")).await.unwrap();
        assert!(second.blocked);
        assert_eq!(second.stage, VerdictStage::ThreatHit);
        assert_eq!(second.detection_method, DetectionMethod::MultiLine);
        assert_eq!(
            second.bypass.as_ref().map(|b| b.message_ids.clone()),
            Some(vec![10, 11])
        );
        assert_eq!(h.engine.bypass.len(KEY), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fragment_cannot_reuse_a_match() {
        let scorer = MockScorer::with_scores(
            0.9,
            [(ScoreCategory::Toxicity, 0.9)].into_iter().collect(),
        );
        *scorer.delay.lock().unwrap() = Some(Duration::from_millis(200));
        let h = harness_with(EngineConfig::default(), scorer);
        h.engine
            .add_word(1, WordList::Whitelist, "hello")
            .await
            .unwrap();
        h.engine.bypass.add(KEY, "stupid", 9, Utc::now());

        let engine = Arc::new(h.engine);
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.process(&message(10, "idiot")).await })
        };
        // Arrives while the first run is still waiting on the scorer.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = engine.process(&message(11, "hello")).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert!(first.blocked);
        assert_eq!(
            first.bypass.as_ref().map(|b| b.message_ids.clone()),
            Some(vec![9, 10])
        );
        assert!(!second.blocked);
        assert!(second.bypass.is_none());
        assert_eq!(engine.violations(1, 2).await.unwrap().map(|r| r.count), Some(1));
    }

    #[tokio::test]
    async fn test_long_message_clears_buffer() {
        let h = harness(0.0, &[]);
        h.engine.process(&message(10, "kill")).await.unwrap();
        h.engine
            .process(&message(11, "this is a much longer message about nothing"))
            .await
            .unwrap();
        assert_eq!(h.engine.bypass.len(KEY), 0);

        let verdict = h.engine.process(&message(12, "yourself")).await.unwrap();
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_strikes_escalate_through_ladder() {
        let h = harness(0.0, &[]);
        h.engine
            .add_word(1, WordList::Blacklist, "banana")
            .await
            .unwrap();

        let mut kinds = Vec::new();
        for id in 10..15 {
            let verdict = h.engine.process(&message(id, "banana")).await.unwrap();
            kinds.push(verdict.punishment_applied.unwrap());
        }

        assert_eq!(kinds[0].kind, PunishmentKind::Warn);
        assert_eq!(kinds[1].kind, PunishmentKind::Timeout);
        assert_eq!(kinds[1].timeout_secs, Some(3600));
        assert_eq!(kinds[2].kind, PunishmentKind::Kick);
        assert_eq!(kinds[3].kind, PunishmentKind::Ban);
        // Past the top of the ladder the top rung keeps applying.
        assert_eq!(kinds[4].kind, PunishmentKind::Ban);
        assert_eq!(kinds[4].strike, 5);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_processed_once() {
        let h = harness(0.0, &[]);
        let msg = message(10, "hello");
        assert!(h.engine.process(&msg).await.is_some());
        assert!(h.engine.process(&msg).await.is_none());
    }

    #[tokio::test]
    async fn test_unmoderated_messages() {
        let h = harness(0.0, &[]);

        let mut bot = message(10, "banana");
        bot.author_is_bot = true;
        assert!(h.engine.process(&bot).await.is_none());

        assert!(h.engine.process(&message(11, "   ")).await.is_none());

        h.engine
            .update_policy(
                1,
                GuildPolicyOverrides {
                    exempt_users: Some(vec![2]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(h.engine.process(&message(12, "I'll kill you")).await.is_none());

        h.engine
            .update_policy(
                1,
                GuildPolicyOverrides {
                    enabled: Some(false),
                    exempt_users: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(h.engine.process(&message(13, "I'll kill you")).await.is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_verdict() {
        let h = harness(0.0, &[]);
        h.store.fail_writes.store(true, Ordering::SeqCst);

        let verdict = h.engine.process(&message(10, "I'll kill you")).await.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.strike_count_after, None);
        assert!(verdict
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::PersistenceWriteFailed { .. })));
        assert_eq!(h.reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evaluate_has_no_side_effects() {
        let config = EngineConfig {
            rate_limits: RateLimits {
                per_user: 1,
                global: 1,
                ..RateLimits::default()
            },
            ..EngineConfig::default()
        };
        let h = harness_with(
            config,
            MockScorer::with_scores(0.9, [(ScoreCategory::Toxicity, 0.9)].into_iter().collect()),
        );

        let threat = h.engine.evaluate(1, "I'll kill you").await;
        assert!(threat.blocked);
        assert_eq!(threat.strike_count_after, None);
        assert!(h.engine.violations(1, 2).await.unwrap().is_none());

        // Scored twice without touching the one-message quota.
        for _ in 0..2 {
            let scored = h.engine.evaluate(1, "you are a terrible person").await;
            assert_eq!(scored.stage, VerdictStage::Scored);
            assert!(scored.blocked);
        }
        assert!(h.actions.applied.lock().unwrap().is_empty());
        assert_eq!(h.engine.rate_limiter.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_attachment_text_is_analysed() {
        let store = Arc::new(MockStore::default());
        let extractor = Arc::new(MockExtractor::default());
        extractor
            .texts
            .insert("https://cdn.example/meme.png".to_string(), "send nudes".to_string());
        let collaborators = Collaborators::new(
            store,
            Arc::new(MockScorer::default()),
            Arc::new(RecordingActions::default()),
            Arc::new(RecordingReporter::default()),
        )
        .with_text_extractor(extractor);
        let engine = PolicyEngine::new(EngineConfig::default(), collaborators);

        let mut msg = message(10, "look at this");
        msg.attachments.push(Attachment {
            url: "https://cdn.example/meme.png".to_string(),
            content_type: Some("image/png".to_string()),
        });

        let verdict = engine.process(&msg).await.unwrap();
        assert!(verdict.blocked);
        assert_eq!(verdict.stage, VerdictStage::ExplicitHit);
        assert_eq!(verdict.detection_method, DetectionMethod::Attachment);
    }

    #[tokio::test]
    async fn test_suspicious_links_are_flagged() {
        let reputation = Arc::new(MockReputation {
            bad_fragments: vec!["free-nitro".to_string()],
        });
        let collaborators = Collaborators::new(
            Arc::new(MockStore::default()),
            Arc::new(MockScorer::default()),
            Arc::new(RecordingActions::default()),
            Arc::new(RecordingReporter::default()),
        )
        .with_link_reputation(reputation);
        let engine = PolicyEngine::new(EngineConfig::default(), collaborators);

        let verdict = engine
            .process(&message(
                10,
                "check https://free-nitro.example/claim and https://docs.rs",
            ))
            .await
            .unwrap();
        assert_eq!(verdict.link_flags.len(), 1);
        assert_eq!(verdict.link_flags[0].url, "https://free-nitro.example/claim");
        assert!(!verdict.blocked);
    }

    #[tokio::test]
    async fn test_spam_burst_is_flagged_but_analysed() {
        let h = harness(0.0, &[]);
        h.engine
            .update_policy(
                1,
                GuildPolicyOverrides {
                    spam_max_messages: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!h.engine.process(&message(10, "hi")).await.unwrap().spam_burst);
        assert!(!h.engine.process(&message(11, "hi")).await.unwrap().spam_burst);
        let third = h.engine.process(&message(12, "I'll kill you")).await.unwrap();
        assert!(third.spam_burst);
        assert!(third.blocked);
    }

    #[tokio::test]
    async fn test_purge_guild_and_sweep() {
        let h = harness(0.0, &[]);
        h.engine.process(&message(10, "I'll kill you")).await.unwrap();
        h.engine.set_sensitivity(1, 5).await.unwrap();

        assert_eq!(h.engine.purge_guild(1).await.unwrap(), 1);
        assert!(h.engine.violations(1, 2).await.unwrap().is_none());
        assert_eq!(h.engine.policy(1).await.unwrap(), GuildPolicy::default());

        let report = h.engine.sweep(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(report.processed_ids, 1);
        assert!(report.spam_windows >= 1);
    }
}
