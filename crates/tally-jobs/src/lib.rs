//! # tally-jobs
//!
//! Stream aggregation workers for tally.
//!
//! This crate provides:
//! - The aggregation worker (read, group, persist, fan out, acknowledge)
//! - A pool running N workers on one shutdown signal
//! - Bounded best-effort dispatch for non-critical sinks
//! - Worker events via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use tally_jobs::{WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(port)
//!     .with_config(WorkerConfig::from_env())
//!     .with_metrics(metrics)
//!     .build();
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//!
//! // Graceful shutdown
//! handle.stop().await?;
//! ```

pub mod fanout;
pub mod worker;

// Re-export core types
pub use tally_core::*;

pub use fanout::BestEffortDispatcher;
pub use worker::{
    AggregationWorker, BatchFailure, BatchOutcome, BatchStage, BatchSummary, WorkerBuilder,
    WorkerConfig, WorkerEvent, WorkerHandle, WorkerPool, WorkerState,
};
