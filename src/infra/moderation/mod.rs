pub mod error_log;
pub mod in_memory_store;
pub mod perspective_scorer;
pub mod sqlite_store;
pub mod tracing_actions;

pub use error_log::KvErrorReporter;
pub use in_memory_store::InMemoryKvStore;
pub use perspective_scorer::PerspectiveScorer;
pub use sqlite_store::SqliteKvStore;
pub use tracing_actions::TracingActions;
