//! cctrace-core - Core types and business logic for Claude Code traces
//!
//! This crate provides the transcript record schema, turn assembly, tool
//! event correlation and text truncation. It performs no I/O; reading
//! transcripts and persisting state live in `cctrace-state`.

pub mod correlate;
pub mod parser;
pub mod truncate;
pub mod turns;
pub mod types;

pub use correlate::*;
pub use parser::*;
pub use truncate::*;
pub use turns::*;
pub use types::*;
