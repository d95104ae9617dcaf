//! Error taxonomy for dataset construction and iteration.
//!
//! Public functions return [`anyhow::Result`]; the variants below are the
//! failures callers typically need to tell apart, reachable through
//! `err.downcast_ref::<DatasetError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    // ========== Configuration Errors ==========

    /// An option has a value the pipeline cannot work with.
    #[error("invalid dataset configuration: {0}")]
    Config(String),

    /// The shard source resolved to an empty list.
    #[error("shard source {source_desc} resolved to no shards")]
    EmptyShardList { source_desc: String },

    /// A brace pattern could not be expanded.
    #[error("bad shard pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    /// A stage returned no stream while the pipeline was being assembled.
    #[error("pipeline stage #{index} ({stage}) returned no stream")]
    Assembly { index: usize, stage: String },

    /// A stage received a stream element of the wrong kind.
    #[error("stage {stage} expected a {expected} but received a {found}")]
    UnexpectedUnit {
        stage: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    // ========== Data Errors ==========

    /// No handler is registered for the URL scheme.
    #[error("{url}: no opener for scheme {scheme:?}")]
    UnsupportedScheme { url: String, scheme: String },

    /// The archive stream is not a well-formed tar file.
    #[error("malformed archive {url}: {reason}")]
    Archive { url: String, reason: String },

    /// Two members of the same sample share a suffix.
    #[error("duplicate file name {suffix:?} in sample {key:?} of {url}")]
    DuplicateMember {
        key: String,
        suffix: String,
        url: String,
    },

    /// Collation could not merge a batch.
    #[error("cannot collate batch: {0}")]
    Collation(String),

    /// `check_empty` is set and an epoch produced nothing.
    #[error("epoch {epoch} yielded no samples")]
    EmptyEpoch { epoch: i64 },

    // ========== Lifecycle Errors ==========

    /// The dataset was closed; it cannot be iterated again.
    #[error("dataset is closed")]
    Closed,
}

impl DatasetError {
    /// True for programmer or configuration mistakes, which are never routed
    /// through the error handler.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::EmptyShardList { .. }
                | Self::Pattern { .. }
                | Self::Assembly { .. }
                | Self::UnexpectedUnit { .. }
        )
    }
}
