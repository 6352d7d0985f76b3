//! `cadence-core`: configuration, shared identifiers and the task payload
//! descriptor used by the scheduler and every dispatch sink.

pub mod config;
pub mod error;
pub mod payload;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use payload::{ArgValue, TaskPayload};
pub use types::ExecutionId;
