//! Byte-level collaborators of the pipeline: opening URLs, decompression,
//! shard globbing and tar member expansion.

pub mod compression;
pub mod glob;
pub mod gopen;
pub mod tar;
