pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod queue;
pub mod script;
pub mod step;
pub mod temp;
pub mod tools;
#[cfg(test)]
mod test_support;

pub use config::AppConfig;
pub use error::AppError;
pub use job::Job;
pub use queue::{QueueEvent, QueueProcessor};
