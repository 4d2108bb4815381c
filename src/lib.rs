// Moderation decision engine for chat guilds.
//
// - `core/` = Business logic (platform-agnostic), including the ports it needs
// - `infra/` = Implementations of core traits (databases, APIs)
// - `settings` = Process configuration from the environment

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with several mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
pub mod core;
#[path = "infra/infra_layer.rs"]
pub mod infra;
pub mod settings;

pub use crate::core::moderation::{InboundMessage, PolicyEngine, Verdict};
pub use crate::settings::{ConfigError, EngineSettings};
