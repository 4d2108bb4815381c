// Moderation-action executor for headless runs: every action is logged and
// nothing reaches a chat platform.

use crate::core::moderation::{
    ActionTarget, CollaboratorError, ModerationActions, PunishmentKind, ResolvedPunishment,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct TracingActions {
    applied: AtomicU64,
    notices: AtomicU64,
}

impl TracingActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn notice_count(&self) -> u64 {
        self.notices.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModerationActions for TracingActions {
    async fn apply(
        &self,
        target: &ActionTarget,
        punishment: &ResolvedPunishment,
        reason: &str,
    ) -> Result<(), CollaboratorError> {
        match punishment.kind {
            PunishmentKind::Timeout => tracing::info!(
                guild_id = target.guild_id,
                user_id = target.user_id,
                strike = punishment.strike,
                timeout_secs = punishment.timeout_secs,
                reason,
                "Timeout applied"
            ),
            kind => tracing::info!(
                guild_id = target.guild_id,
                user_id = target.user_id,
                strike = punishment.strike,
                %kind,
                reason,
                "Punishment applied"
            ),
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn notify(&self, channel_id: u64, notice: &str) -> Result<(), CollaboratorError> {
        tracing::info!(channel_id, notice, "Moderation notice");
        self.notices.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
