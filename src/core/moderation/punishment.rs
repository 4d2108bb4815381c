// Punishment ladder - maps a strike count to a concrete consequence.

use super::moderation_models::{PunishmentKind, ResolvedPunishment};
use super::policy_config::GuildPolicy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Used when a timeout rung has no valid duration configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

static RE_DURATION: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(\d+)([mhd])$").ok());

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("Duration must look like 10m, 1h or 1d, got '{0}'")]
    Malformed(String),

    #[error("Duration '{input}' is out of range (max {max_days} days)")]
    OutOfRange { input: String, max_days: u32 },
}

/// Parse `<number><m|h|d>` into a duration no longer than `max_days` days.
/// Zero-length durations are rejected.
pub fn parse_duration(input: &str, max_days: u32) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    let caps = RE_DURATION
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .ok_or_else(|| DurationError::Malformed(input.to_string()))?;

    let out_of_range = || DurationError::OutOfRange {
        input: input.to_string(),
        max_days,
    };

    let value: u64 = caps[1].parse().map_err(|_| out_of_range())?;
    let unit_secs = match &caps[2] {
        "m" => 60,
        "h" => 60 * 60,
        _ => 24 * 60 * 60,
    };

    let secs = value.checked_mul(unit_secs).ok_or_else(out_of_range)?;
    if secs == 0 || secs > u64::from(max_days) * 24 * 60 * 60 {
        return Err(out_of_range());
    }

    Ok(Duration::from_secs(secs))
}

/// Greatest entry whose key is not above `count`.
fn rung_at<V>(ladder: &BTreeMap<u32, V>, count: u32) -> Option<(u32, &V)> {
    ladder.range(..=count).next_back().map(|(k, v)| (*k, v))
}

pub struct PunishmentLadder;

impl PunishmentLadder {
    /// Resolve the consequence for the `count`-th strike.
    ///
    /// Exact rung first, then the greatest rung below `count` (so counts past
    /// the top of the ladder keep getting the top rung), then `warn`. Never
    /// resolves to "nothing".
    ///
    /// A gap inside the ladder does not jump to the highest configured rung.
    /// It takes the safe-default fallback instead: the nearest rung below, so
    /// `{1: warn, 5: kick}` warns on strike 3 and only kicks from strike 5.
    pub fn resolve(count: u32, policy: &GuildPolicy) -> ResolvedPunishment {
        let kind = match rung_at(&policy.punishments, count) {
            Some((_, kind)) => *kind,
            None => {
                tracing::debug!(count, "No punishment rung at or below strike count, warning");
                PunishmentKind::Warn
            }
        };

        let timeout_secs = match kind {
            PunishmentKind::Timeout => Some(Self::timeout_for(count, policy).as_secs()),
            _ => None,
        };

        ResolvedPunishment {
            strike: count,
            kind,
            timeout_secs,
        }
    }

    fn timeout_for(count: u32, policy: &GuildPolicy) -> Duration {
        let Some((strike, raw)) = rung_at(&policy.timeout_durations, count) else {
            return DEFAULT_TIMEOUT;
        };

        match parse_duration(raw, policy.max_timeout_days) {
            Ok(duration) => duration,
            Err(e) => {
                tracing::warn!(strike, error = %e, "Invalid timeout duration, using default");
                DEFAULT_TIMEOUT
            }
        }
    }
}
