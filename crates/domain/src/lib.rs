pub mod models;
pub mod ports;
pub mod value_objects;
pub mod views;

pub use devpool_errors::{SchedulerError, SchedulerResult};
pub use models::*;
pub use ports::*;
pub use value_objects::*;
pub use views::*;
