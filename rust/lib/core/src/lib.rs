pub mod config;
pub mod context;
pub mod error;

pub use config::ServiceConfig;
pub use context::Context;
pub use error::{ServiceError, error_code};
