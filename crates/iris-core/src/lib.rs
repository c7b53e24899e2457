//! `iris-core`: configuration, errors and logging shared by the IRIS kernel crates.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::{CompletionTarget, CycleConfig, IrisConfig};
pub use error::{IrisError, Result};
pub use types::SubscriberId;
