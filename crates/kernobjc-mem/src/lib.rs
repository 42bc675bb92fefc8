//! Memory management for the `kernobjc` runtime.
//!
//! - [`arena::MetadataArena`]: lock-free bump allocation for write-once
//!   runtime metadata, optionally bounded by a chunk limit
//! - [`arena::metadata_arena`]: the process-wide arena that class and method
//!   records live in

pub mod arena;

pub use arena::{ArenaAllocError, ArenaStats, MetadataArena, metadata_arena};
