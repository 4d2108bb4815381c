// Frequency guards that are independent from toxicity.
//
// - Human bursts: too many messages from one user in one guild.
// - Our own output: too many notices posted in one channel, which would
//   otherwise feed back into more violations and more notices.

use super::rate_limiter::RateWindow;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Defaults for the outbound (self-message) guard.
pub const DEFAULT_OUTBOUND_LIMIT: u32 = 10;
pub const DEFAULT_OUTBOUND_WINDOW_MS: i64 = 60_000;

pub struct SpamGuard {
    user_windows: DashMap<(u64, u64), RateWindow>,
    outbound_windows: DashMap<u64, RateWindow>,
    outbound_limit: u32,
    outbound_window: Duration,
}

impl SpamGuard {
    pub fn new(outbound_limit: u32, outbound_window: Duration) -> Self {
        Self {
            user_windows: DashMap::new(),
            outbound_windows: DashMap::new(),
            outbound_limit,
            outbound_window,
        }
    }

    /// Record a message from `user_id` and report whether it is part of a burst
    /// (more than `max_messages` within `window`).
    pub fn is_user_burst(
        &self,
        guild_id: u64,
        user_id: u64,
        max_messages: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let mut counter = self
            .user_windows
            .entry((guild_id, user_id))
            .or_insert_with(|| RateWindow::new(max_messages, window));
        counter.set_limit(max_messages);
        counter.set_window(window);
        counter.try_admit(now).is_err()
    }

    /// Whether we may post another message of our own in `channel_id`.
    /// Admitted posts are counted.
    pub fn allow_outbound(&self, channel_id: u64, now: DateTime<Utc>) -> bool {
        let mut counter = self
            .outbound_windows
            .entry(channel_id)
            .or_insert_with(|| RateWindow::new(self.outbound_limit, self.outbound_window));

        match counter.try_admit(now) {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(channel_id, "Outbound message limit reached, suppressing notice");
                false
            }
        }
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.user_windows.len() + self.outbound_windows.len();
        self.user_windows.retain(|_, w| {
            w.prune(now);
            !w.is_empty()
        });
        self.outbound_windows.retain(|_, w| {
            w.prune(now);
            !w.is_empty()
        });
        before - (self.user_windows.len() + self.outbound_windows.len())
    }
}

impl Default for SpamGuard {
    fn default() -> Self {
        Self::new(
            DEFAULT_OUTBOUND_LIMIT,
            Duration::milliseconds(DEFAULT_OUTBOUND_WINDOW_MS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_burst_detection() {
        let guard = SpamGuard::default();
        let now = Utc::now();
        let window = Duration::seconds(10);

        for i in 0..5 {
            assert!(
                !guard.is_user_burst(1, 2, 5, window, now + Duration::milliseconds(i)),
                "message {} should not be a burst",
                i
            );
        }
        assert!(guard.is_user_burst(1, 2, 5, window, now + Duration::milliseconds(10)));

        // Other users and guilds are tracked separately.
        assert!(!guard.is_user_burst(1, 3, 5, window, now));
        assert!(!guard.is_user_burst(9, 2, 5, window, now));

        // The window slides.
        assert!(!guard.is_user_burst(1, 2, 5, window, now + Duration::seconds(11)));
    }

    #[test]
    fn test_outbound_guard_prevents_feedback_loops() {
        let guard = SpamGuard::new(2, Duration::seconds(60));
        let now = Utc::now();
        assert!(guard.allow_outbound(42, now));
        assert!(guard.allow_outbound(42, now));
        assert!(!guard.allow_outbound(42, now));
        assert!(guard.allow_outbound(43, now));
        assert!(guard.allow_outbound(42, now + Duration::seconds(61)));
    }

    #[test]
    fn test_sweep() {
        let guard = SpamGuard::default();
        let now = Utc::now();
        guard.is_user_burst(1, 1, 5, Duration::seconds(10), now);
        guard.allow_outbound(1, now);
        assert_eq!(guard.sweep(now + Duration::seconds(120)), 2);
    }
}
