// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod config;
pub mod crosscheck;
pub mod duty_window;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod normalize;
pub mod notify;
pub mod parse;
pub mod pipeline;
pub mod provinces;
pub mod source_weights;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::crosscheck::{cross_check, CrossCheckOutput, VerifiedRecord};
pub use crate::error::{IngestError, IngestResult};
pub use crate::pipeline::{Pipeline, PullReport};
pub use crate::store::{IngestStore, SqliteStore};
