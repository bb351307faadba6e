//! # tally-core
//!
//! Core types, traits, and pure logic for the tally event aggregator.
//!
//! This crate provides the data model, the storage-port traits every backend
//! implements, message parsing, window grouping, and in-memory stores used
//! by tests across the workspace.

pub mod defaults;
pub mod error;
pub mod memory;
pub mod models;
pub mod parse;
pub mod snowflake;
pub mod timeout;
pub mod traits;
pub mod window;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use parse::{parse_message, DefaultedField, FieldDefect, ParsedEvent};
pub use snowflake::Snowflake;
pub use timeout::bounded;
pub use traits::*;
pub use window::{aggregate, AggregationPlan, WindowSize};
