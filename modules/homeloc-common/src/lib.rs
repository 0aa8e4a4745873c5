pub mod config;
pub mod error;
pub mod places;
pub mod types;

pub use config::{PipelineConfig, RetrySettings, Secrets};
pub use error::PipelineError;
pub use types::*;
