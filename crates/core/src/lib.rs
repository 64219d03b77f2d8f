pub mod atomic;
pub mod config;
pub mod error;
pub mod input;
pub mod task;

pub use config::{Config, CriticalPolicy, RetryPolicy, ALL_UNITS_JOBS};
pub use error::*;
pub use task::*;
