pub mod checkpoint;
pub mod task;
pub mod worker;

pub use checkpoint::*;
pub use task::*;
pub use worker::*;
