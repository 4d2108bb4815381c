// Core moderation module - the message decision engine.
// One file per component; the engine in `policy_engine` wires them together.

pub mod bypass_buffer;
pub mod dedup;
pub mod keyed_locks;
pub mod moderation_models;
pub mod moderation_ports;
pub mod pattern_detectors;
pub mod policy_config;
pub mod policy_engine;
pub mod punishment;
pub mod rate_limiter;
pub mod spam_guard;
pub mod strike_ledger;
pub mod sweeper;
pub mod text_normalizer;

#[cfg(test)]
pub(crate) mod test_doubles;

pub use moderation_models::*;
pub use moderation_ports::*;
pub use policy_config::{GuildPolicy, GuildPolicyOverrides, WordList};
pub use policy_engine::{EngineConfig, PolicyEngine, SweepReport};
pub use punishment::{parse_duration, DurationError, PunishmentLadder};
pub use rate_limiter::RateLimits;
pub use sweeper::Sweeper;
pub use text_normalizer::normalize;
