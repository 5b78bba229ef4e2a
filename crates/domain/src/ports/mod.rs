pub mod checkpoint_store;
pub mod executor;
pub mod notifier;

pub use checkpoint_store::*;
pub use executor::*;
pub use notifier::*;
