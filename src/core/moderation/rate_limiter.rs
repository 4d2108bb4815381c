// Tiered sliding-window rate limiting for the external scorer.
//
// Three independent windows: one global, one per guild, one per user.
// Exceeding any of them never blocks a message; the engine only skips the
// expensive scoring step for it (fail-open).

use super::moderation_models::{RateCheck, RateScope};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Sliding-window counter over event timestamps.
#[derive(Debug, Clone)]
pub struct RateWindow {
    timestamps: VecDeque<DateTime<Utc>>,
    limit: u32,
    window: Duration,
}

impl RateWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            limit,
            window,
        }
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Drop every timestamp that fell out of the window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.timestamps.front() {
            if now - *oldest >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then admit `now` if under the limit.
    ///
    /// Returns `Err(retry_after_secs)` when the window is full; nothing is
    /// recorded in that case.
    pub fn try_admit(&mut self, now: DateTime<Utc>) -> Result<(), u64> {
        self.prune(now);

        if self.timestamps.len() >= self.limit as usize {
            let retry_after = match self.timestamps.front() {
                Some(oldest) => {
                    let remaining = self.window - (now - *oldest);
                    ceil_secs(remaining)
                }
                None => ceil_secs(self.window),
            };
            return Err(retry_after.max(1));
        }

        self.timestamps.push_back(now);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

/// Default quotas for the three tiers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub global: u32,
    pub per_guild: u32,
    pub per_user: u32,
    pub window: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            global: 50,
            per_guild: 10,
            per_user: 3,
            window: Duration::milliseconds(60_000),
        }
    }
}

/// Admission control in front of the external scorer.
///
/// Per-key windows live in `DashMap`s; the entry API holds the shard lock
/// for the whole prune-check-append so concurrent checks on one key cannot
/// lose updates.
pub struct RateLimiter {
    limits: RateLimits,
    global: Mutex<RateWindow>,
    guilds: DashMap<u64, RateWindow>,
    users: DashMap<u64, RateWindow>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            global: Mutex::new(RateWindow::new(limits.global, limits.window)),
            guilds: DashMap::new(),
            users: DashMap::new(),
            limits,
        }
    }

    pub fn check_global(&self) -> RateCheck {
        self.check_global_at(Utc::now())
    }

    pub fn check_global_at(&self, now: DateTime<Utc>) -> RateCheck {
        let mut window = self.global.lock().unwrap_or_else(|e| e.into_inner());
        Self::outcome(RateScope::Global, window.try_admit(now))
    }

    /// Per-guild check. `custom_limit` overrides the default quota for this guild.
    pub fn check_guild(&self, guild_id: u64, custom_limit: Option<u32>) -> RateCheck {
        self.check_guild_at(guild_id, custom_limit, Utc::now())
    }

    pub fn check_guild_at(
        &self,
        guild_id: u64,
        custom_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> RateCheck {
        let limit = custom_limit.unwrap_or(self.limits.per_guild);
        let mut window = self
            .guilds
            .entry(guild_id)
            .or_insert_with(|| RateWindow::new(limit, self.limits.window));
        window.set_limit(limit);
        Self::outcome(RateScope::Guild, window.try_admit(now))
    }

    pub fn check_user(&self, user_id: u64) -> RateCheck {
        self.check_user_at(user_id, Utc::now())
    }

    pub fn check_user_at(&self, user_id: u64, now: DateTime<Utc>) -> RateCheck {
        let mut window = self
            .users
            .entry(user_id)
            .or_insert_with(|| RateWindow::new(self.limits.per_user, self.limits.window));
        Self::outcome(RateScope::User, window.try_admit(now))
    }

    /// Global, then guild, then user. Stops at the first exhausted window.
    pub fn check_all_at(
        &self,
        guild_id: u64,
        custom_guild_limit: Option<u32>,
        user_id: u64,
        now: DateTime<Utc>,
    ) -> RateCheck {
        let global = self.check_global_at(now);
        if global.limited {
            return global;
        }

        let guild = self.check_guild_at(guild_id, custom_guild_limit, now);
        if guild.limited {
            return guild;
        }

        self.check_user_at(user_id, now)
    }

    /// Prune every window and forget the empty ones.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        if let Ok(mut global) = self.global.lock() {
            global.prune(now);
        }

        let before = self.guilds.len() + self.users.len();
        for map in [&self.guilds, &self.users] {
            map.retain(|_, window| {
                window.prune(now);
                !window.is_empty()
            });
        }
        before - (self.guilds.len() + self.users.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.guilds.len() + self.users.len()
    }

    fn outcome(scope: RateScope, admitted: Result<(), u64>) -> RateCheck {
        match admitted {
            Ok(()) => RateCheck::admitted(),
            Err(retry_after_secs) => RateCheck::limited(scope, retry_after_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(global: u32, per_guild: u32, per_user: u32) -> RateLimiter {
        RateLimiter::new(RateLimits {
            global,
            per_guild,
            per_user,
            window: Duration::milliseconds(60_000),
        })
    }

    #[test]
    fn test_sliding_window_denies_then_recovers() {
        let limiter = limiter(100, 100, 3);
        let start = Utc::now();

        for i in 0..3 {
            let check = limiter.check_user_at(7, start + Duration::milliseconds(i * 10));
            assert!(!check.limited, "check {} should pass", i);
        }

        let denied = limiter.check_user_at(7, start + Duration::milliseconds(1_000));
        assert!(denied.limited);
        assert_eq!(denied.scope, Some(RateScope::User));
        assert!(denied.retry_after_secs > 0);
        assert_eq!(denied.retry_after_secs, 59);

        let later = limiter.check_user_at(7, start + Duration::milliseconds(60_001));
        assert!(!later.limited);
    }

    #[test]
    fn test_denied_check_is_not_recorded() {
        let mut window = RateWindow::new(1, Duration::seconds(10));
        let now = Utc::now();
        assert!(window.try_admit(now).is_ok());
        assert!(window.try_admit(now).is_err());
        assert!(window.try_admit(now).is_err());
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_order_is_global_guild_user() {
        let limiter = limiter(1, 10, 10);
        let now = Utc::now();
        assert!(!limiter.check_all_at(1, None, 1, now).limited);

        let check = limiter.check_all_at(2, None, 2, now);
        assert!(check.limited);
        assert_eq!(check.scope, Some(RateScope::Global));
    }

    #[test]
    fn test_custom_guild_limit() {
        let limiter = limiter(100, 10, 100);
        let now = Utc::now();
        assert!(!limiter.check_guild_at(5, Some(2), now).limited);
        assert!(!limiter.check_guild_at(5, Some(2), now).limited);
        let check = limiter.check_guild_at(5, Some(2), now);
        assert!(check.limited);
        assert_eq!(check.scope, Some(RateScope::Guild));

        // Another guild still gets the default quota.
        assert!(!limiter.check_guild_at(6, None, now).limited);
    }

    #[test]
    fn test_sweep_removes_expired_windows() {
        let limiter = limiter(100, 100, 100);
        let now = Utc::now();
        limiter.check_all_at(1, None, 1, now);
        limiter.check_all_at(2, None, 2, now);
        assert_eq!(limiter.tracked_keys(), 4);

        let removed = limiter.sweep(now + Duration::seconds(61));
        assert_eq!(removed, 4);
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
