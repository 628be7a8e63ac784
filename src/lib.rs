pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod validation;

pub use config::{Config, EngineConfig, LlmConfig};
pub use error::AppError;
pub use models::*;
pub use services::*;
pub use validation::*;
