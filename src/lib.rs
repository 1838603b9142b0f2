//! Batch ingestion of structural element registers with stable task ordering.
//!
//! This crate ingests large register files describing structural elements (beams,
//! columns, girders) for a construction project. An upload is partitioned into
//! fixed-size batches which a background daemon processes concurrently, with
//! per-batch success/failure tracking, retry, and cleanup under partial failure.
//! Each created element carries an ordered list of follow-up tasks; a fractional
//! order-index sequencer keeps that list stably ordered under arbitrary
//! insertions without ever renumbering siblings.
//!
//! Persistence and row access are trait seams: `Storage` (with an in-memory
//! implementation) and `RowSource` (with a mock for tests).

pub mod daemon;
pub mod domain;
pub mod error;
pub mod manager;
pub mod rows;
pub mod sequencer;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use daemon::{Daemon, DaemonConfig};
pub use domain::*;
pub use error::{GirderError, Result};
pub use manager::{IngestConfig, IngestManager, PositionHint};
pub use rows::{FetchCall, FileRef, MockRowSource, RegisterRow, RowSource};
pub use sequencer::{OrderKey, Placement, Sequencer};
pub use storage::{MemoryStore, Storage};
pub use workflow::WorkflowKind;
