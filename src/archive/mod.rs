//! Per-year archive shards and the pass that fills them.

pub mod catalog;
pub mod manager;

pub use catalog::{ArchiveCatalog, ShardInfo};
pub use manager::{
    ArchiveManager, ArchivePass, ArchivePolicy, ArchiveResult, EntryKind, ShardCursor,
    ShardQuery, ShardSummary,
};
