pub mod checkpoint_store;
pub mod notifier;

pub use checkpoint_store::{FileCheckpointStore, InMemoryCheckpointStore};
pub use notifier::LoggingNotifier;
