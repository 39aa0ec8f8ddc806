//! Segmented append-only log storage engine.
//!
//! Addresses form one global, dense, 64-bit space. Each consecutive run of
//! `records_per_segment` addresses is owned by one segment, stored as a
//! `<id>.log` file plus two sidecars (`<id>.log.trimmed`, `<id>.log.pending`)
//! that record tombstones separately from the immutable log data. See
//! [`engine::Engine`] for the entry point.

pub mod append;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod proto;
pub mod scan;
pub mod segment;
pub mod server_context;
pub mod trim;

pub use append::AppendRequest;
pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, Record};
pub use error::{Error, Result};
pub use proto::{DataType, LogEntry, LogHeader, Metadata, Rank, TrimEntry};
pub use server_context::{FileServerContext, ServerContext};
