pub mod app_config;
pub mod dispatcher;
pub mod observability;
pub mod remote;

pub use app_config::AppConfig;
pub use dispatcher::{CheckpointConfig, DispatcherConfig, RetryConfig};
pub use observability::ObservabilityConfig;
pub use remote::{PoolWorkerConfig, RemoteConfig};
