// Guild policy - typed per-guild configuration plus the admin operations that edit it.
//
// Guilds only persist the fields they changed (`GuildPolicyOverrides`);
// `GuildPolicy::merge` turns that into a fully populated policy.

use super::keyed_locks::KeyedLocks;
use super::moderation_models::{PunishmentKind, ScoreCategory};
use super::moderation_ports::{KeyValueStore, ModerationError, StoreError};
use super::punishment::parse_duration;
use super::text_normalizer::normalize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CONFIG_NAMESPACE: &str = "config";
/// Highest strike number an admin may configure a rung for.
pub const MAX_CONFIGURABLE_STRIKE: u32 = 10;
pub const MAX_SENSITIVITY: u8 = 10;

pub fn config_key(guild_id: u64) -> String {
    format!("guild_{}", guild_id)
}

// ============================================================================
// POLICY
// ============================================================================

/// Fully populated policy for one guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildPolicy {
    pub enabled: bool,
    /// Global block threshold in [0, 1].
    pub threshold: f64,
    /// Per-category cutoffs; categories missing here use `threshold`.
    pub category_thresholds: BTreeMap<ScoreCategory, f64>,
    pub punishments: BTreeMap<u32, PunishmentKind>,
    /// Strike number to `<n><m|h|d>`.
    pub timeout_durations: BTreeMap<u32, String>,
    pub max_timeout_days: u32,
    pub whitelist_words: Vec<String>,
    pub blacklist_words: Vec<String>,
    pub exempt_users: Vec<u64>,
    /// Custom per-guild scorer quota.
    pub guild_rate_limit: Option<u32>,
    pub spam_max_messages: u32,
    pub spam_window_ms: u64,
    pub anti_bypass: bool,
    pub context_analysis: bool,
    pub deep_context_analysis: bool,
    pub spam_protection: bool,
    pub image_detection: bool,
    pub link_protection: bool,
}

impl Default for GuildPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.75,
            category_thresholds: BTreeMap::new(),
            punishments: BTreeMap::from([
                (1, PunishmentKind::Warn),
                (2, PunishmentKind::Timeout),
                (3, PunishmentKind::Kick),
                (4, PunishmentKind::Ban),
            ]),
            timeout_durations: BTreeMap::from([
                (1, "10m".to_string()),
                (2, "1h".to_string()),
                (3, "24h".to_string()),
            ]),
            max_timeout_days: 28,
            whitelist_words: Vec::new(),
            blacklist_words: Vec::new(),
            exempt_users: Vec::new(),
            guild_rate_limit: None,
            spam_max_messages: 5,
            spam_window_ms: 10_000,
            anti_bypass: true,
            context_analysis: true,
            deep_context_analysis: true,
            spam_protection: true,
            image_detection: true,
            link_protection: true,
        }
    }
}

/// What a guild actually stored. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildPolicyOverrides {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub category_thresholds: Option<BTreeMap<ScoreCategory, f64>>,
    pub punishments: Option<BTreeMap<u32, PunishmentKind>>,
    pub timeout_durations: Option<BTreeMap<u32, String>>,
    pub max_timeout_days: Option<u32>,
    pub whitelist_words: Option<Vec<String>>,
    pub blacklist_words: Option<Vec<String>>,
    pub exempt_users: Option<Vec<u64>>,
    pub guild_rate_limit: Option<u32>,
    pub spam_max_messages: Option<u32>,
    pub spam_window_ms: Option<u64>,
    pub anti_bypass: Option<bool>,
    pub context_analysis: Option<bool>,
    pub deep_context_analysis: Option<bool>,
    pub spam_protection: Option<bool>,
    pub image_detection: Option<bool>,
    pub link_protection: Option<bool>,
}

impl GuildPolicyOverrides {
    /// Layer `newer` on top of `self`: fields set in `newer` win.
    pub fn combine(self, newer: GuildPolicyOverrides) -> Self {
        Self {
            enabled: newer.enabled.or(self.enabled),
            threshold: newer.threshold.or(self.threshold),
            category_thresholds: newer.category_thresholds.or(self.category_thresholds),
            punishments: newer.punishments.or(self.punishments),
            timeout_durations: newer.timeout_durations.or(self.timeout_durations),
            max_timeout_days: newer.max_timeout_days.or(self.max_timeout_days),
            whitelist_words: newer.whitelist_words.or(self.whitelist_words),
            blacklist_words: newer.blacklist_words.or(self.blacklist_words),
            exempt_users: newer.exempt_users.or(self.exempt_users),
            guild_rate_limit: newer.guild_rate_limit.or(self.guild_rate_limit),
            spam_max_messages: newer.spam_max_messages.or(self.spam_max_messages),
            spam_window_ms: newer.spam_window_ms.or(self.spam_window_ms),
            anti_bypass: newer.anti_bypass.or(self.anti_bypass),
            context_analysis: newer.context_analysis.or(self.context_analysis),
            deep_context_analysis: newer.deep_context_analysis.or(self.deep_context_analysis),
            spam_protection: newer.spam_protection.or(self.spam_protection),
            image_detection: newer.image_detection.or(self.image_detection),
            link_protection: newer.link_protection.or(self.link_protection),
        }
    }
}

impl GuildPolicy {
    /// The one place stored overrides meet defaults. Thresholds are clamped
    /// into [0, 1].
    pub fn merge(overrides: GuildPolicyOverrides) -> Self {
        let d = Self::default();
        Self {
            enabled: overrides.enabled.unwrap_or(d.enabled),
            threshold: clamp_unit(overrides.threshold.unwrap_or(d.threshold)),
            category_thresholds: overrides
                .category_thresholds
                .map(|m| m.into_iter().map(|(c, t)| (c, clamp_unit(t))).collect())
                .unwrap_or(d.category_thresholds),
            punishments: overrides.punishments.unwrap_or(d.punishments),
            timeout_durations: overrides.timeout_durations.unwrap_or(d.timeout_durations),
            max_timeout_days: overrides.max_timeout_days.unwrap_or(d.max_timeout_days),
            whitelist_words: overrides.whitelist_words.unwrap_or(d.whitelist_words),
            blacklist_words: overrides.blacklist_words.unwrap_or(d.blacklist_words),
            exempt_users: overrides.exempt_users.unwrap_or(d.exempt_users),
            guild_rate_limit: overrides.guild_rate_limit.or(d.guild_rate_limit),
            spam_max_messages: overrides.spam_max_messages.unwrap_or(d.spam_max_messages),
            spam_window_ms: overrides.spam_window_ms.unwrap_or(d.spam_window_ms),
            anti_bypass: overrides.anti_bypass.unwrap_or(d.anti_bypass),
            context_analysis: overrides.context_analysis.unwrap_or(d.context_analysis),
            deep_context_analysis: overrides
                .deep_context_analysis
                .unwrap_or(d.deep_context_analysis),
            spam_protection: overrides.spam_protection.unwrap_or(d.spam_protection),
            image_detection: overrides.image_detection.unwrap_or(d.image_detection),
            link_protection: overrides.link_protection.unwrap_or(d.link_protection),
        }
    }

    /// Cutoff for one category.
    pub fn threshold_for(&self, category: ScoreCategory) -> f64 {
        self.category_thresholds
            .get(&category)
            .copied()
            .unwrap_or(self.threshold)
    }

    pub fn is_exempt(&self, user_id: u64) -> bool {
        self.exempt_users.contains(&user_id)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Category cutoffs derived from a 0..=10 sensitivity level.
pub fn sensitivity_thresholds(level: u8) -> (f64, BTreeMap<ScoreCategory, f64>) {
    let base = f64::from(level.min(MAX_SENSITIVITY)) / 10.0;
    let categories = BTreeMap::from([
        (ScoreCategory::Toxicity, base),
        (ScoreCategory::SevereToxicity, clamp_unit(base - 0.1)),
        (ScoreCategory::Threat, clamp_unit(base - 0.05)),
        (ScoreCategory::Profanity, clamp_unit(base + 0.05)),
        (ScoreCategory::IdentityAttack, base),
        (ScoreCategory::Insult, base),
    ]);
    (base, categories)
}

/// Which guild word list an admin edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordList {
    Whitelist,
    Blacklist,
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Loads and edits guild policies through the key-value store.
///
/// Edits read, change and write the whole `guild_<id>` record, so they are
/// serialized per guild.
pub struct GuildPolicyRepository {
    store: Arc<dyn KeyValueStore>,
    locks: KeyedLocks<u64>,
}

impl GuildPolicyRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn overrides(&self, guild_id: u64) -> Result<GuildPolicyOverrides, StoreError> {
        match self.store.get(CONFIG_NAMESPACE, &config_key(guild_id)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(GuildPolicyOverrides::default()),
        }
    }

    pub async fn load(&self, guild_id: u64) -> Result<GuildPolicy, StoreError> {
        Ok(GuildPolicy::merge(self.overrides(guild_id).await?))
    }

    /// Layer `changes` over what the guild already stored and persist.
    pub async fn update(
        &self,
        guild_id: u64,
        changes: GuildPolicyOverrides,
    ) -> Result<GuildPolicy, ModerationError> {
        let _guard = self.locks.lock(guild_id).await;
        self.update_locked(guild_id, changes).await
    }

    /// `update` for callers already holding the guild lock.
    async fn update_locked(
        &self,
        guild_id: u64,
        changes: GuildPolicyOverrides,
    ) -> Result<GuildPolicy, ModerationError> {
        let current = self
            .overrides(guild_id)
            .await
            .map_err(ModerationError::PolicyUnavailable)?;
        let combined = current.combine(changes);
        self.save(guild_id, &combined).await?;
        Ok(GuildPolicy::merge(combined))
    }

    pub async fn set_sensitivity(
        &self,
        guild_id: u64,
        level: u8,
    ) -> Result<GuildPolicy, ModerationError> {
        if level > MAX_SENSITIVITY {
            return Err(ModerationError::InvalidConfig(format!(
                "sensitivity must be between 0 and {}, got {}",
                MAX_SENSITIVITY, level
            )));
        }

        let (threshold, categories) = sensitivity_thresholds(level);
        self.update(
            guild_id,
            GuildPolicyOverrides {
                threshold: Some(threshold),
                category_thresholds: Some(categories),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_punishment(
        &self,
        guild_id: u64,
        strike: u32,
        kind: PunishmentKind,
    ) -> Result<GuildPolicy, ModerationError> {
        validate_strike(strike)?;
        let _guard = self.locks.lock(guild_id).await;
        let mut punishments = self.load_for_edit(guild_id).await?.punishments;
        punishments.insert(strike, kind);
        self.update_locked(
            guild_id,
            GuildPolicyOverrides {
                punishments: Some(punishments),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_timeout_duration(
        &self,
        guild_id: u64,
        strike: u32,
        duration: &str,
    ) -> Result<GuildPolicy, ModerationError> {
        validate_strike(strike)?;
        let _guard = self.locks.lock(guild_id).await;
        let policy = self.load_for_edit(guild_id).await?;
        parse_duration(duration, policy.max_timeout_days)
            .map_err(|e| ModerationError::InvalidConfig(e.to_string()))?;

        let mut durations = policy.timeout_durations;
        durations.insert(strike, duration.trim().to_string());
        self.update_locked(
            guild_id,
            GuildPolicyOverrides {
                timeout_durations: Some(durations),
                ..Default::default()
            },
        )
        .await
    }

    /// Add a word to a guild list. Returns `false` if it was already present
    /// (compared in normalized form).
    pub async fn add_word(
        &self,
        guild_id: u64,
        list: WordList,
        word: &str,
    ) -> Result<bool, ModerationError> {
        let word = word.trim();
        if normalize(word).is_empty() {
            return Err(ModerationError::InvalidConfig(
                "word must contain letters or digits".to_string(),
            ));
        }

        let _guard = self.locks.lock(guild_id).await;
        let policy = self.load_for_edit(guild_id).await?;
        let mut words = match list {
            WordList::Whitelist => policy.whitelist_words,
            WordList::Blacklist => policy.blacklist_words,
        };

        let key = normalize(word);
        if words.iter().any(|w| normalize(w) == key) {
            return Ok(false);
        }
        words.push(word.to_string());
        self.update_locked(guild_id, word_list_change(list, words))
            .await?;
        Ok(true)
    }

    /// Remove a word from a guild list. Returns whether anything was removed.
    pub async fn remove_word(
        &self,
        guild_id: u64,
        list: WordList,
        word: &str,
    ) -> Result<bool, ModerationError> {
        let _guard = self.locks.lock(guild_id).await;
        let policy = self.load_for_edit(guild_id).await?;
        let mut words = match list {
            WordList::Whitelist => policy.whitelist_words,
            WordList::Blacklist => policy.blacklist_words,
        };

        let key = normalize(word);
        let before = words.len();
        words.retain(|w| normalize(w) != key);
        if words.len() == before {
            return Ok(false);
        }
        self.update_locked(guild_id, word_list_change(list, words))
            .await?;
        Ok(true)
    }

    /// Drop the stored policy so the guild falls back to defaults.
    pub async fn reset(&self, guild_id: u64) -> Result<bool, ModerationError> {
        let _guard = self.locks.lock(guild_id).await;
        self.store
            .delete(CONFIG_NAMESPACE, &config_key(guild_id))
            .await
            .map_err(ModerationError::PersistenceWriteFailed)
    }

    /// Forget per-guild locks nobody holds.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    async fn load_for_edit(&self, guild_id: u64) -> Result<GuildPolicy, ModerationError> {
        self.load(guild_id)
            .await
            .map_err(ModerationError::PolicyUnavailable)
    }

    async fn save(
        &self,
        guild_id: u64,
        overrides: &GuildPolicyOverrides,
    ) -> Result<(), ModerationError> {
        let value = serde_json::to_value(overrides)
            .map_err(|e| ModerationError::PersistenceWriteFailed(e.into()))?;
        self.store
            .set(CONFIG_NAMESPACE, &config_key(guild_id), value)
            .await
            .map_err(ModerationError::PersistenceWriteFailed)
    }
}

fn validate_strike(strike: u32) -> Result<(), ModerationError> {
    if (1..=MAX_CONFIGURABLE_STRIKE).contains(&strike) {
        Ok(())
    } else {
        Err(ModerationError::InvalidConfig(format!(
            "strike number must be between 1 and {}, got {}",
            MAX_CONFIGURABLE_STRIKE, strike
        )))
    }
}

fn word_list_change(list: WordList, words: Vec<String>) -> GuildPolicyOverrides {
    match list {
        WordList::Whitelist => GuildPolicyOverrides {
            whitelist_words: Some(words),
            ..Default::default()
        },
        WordList::Blacklist => GuildPolicyOverrides {
            blacklist_words: Some(words),
            ..Default::default()
        },
    }
}

// ============================================================================
// TESTS
// ============================================================================
