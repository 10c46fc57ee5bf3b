//src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can abort a load or a run. Per-record problems
/// (malformed reads) are absorbed into counters and never appear here.
#[derive(Debug, Error)]
pub enum HalalError {
    /// Reference catalog failed to parse; no partial catalog is exposed.
    #[error("corrupt reference database: {0}")]
    CorruptDatabase(String),

    /// Index file unreadable or structurally broken.
    #[error("index load failed: {0}")]
    IndexLoadFailed(String),

    /// Index does not match the database it claims to be built from.
    #[error("index/database mismatch: {0}")]
    IndexMismatch(String),

    /// A sample input file could not be opened or read at all.
    /// Fatal for that sample; the rest of the run continues.
    #[error("unreadable input file {path}: {source}")]
    UnreadableInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `start` called while a run is already active.
    #[error("a run is already in progress")]
    RunActive,

    #[error("no samples supplied")]
    NoSamples,

    #[error("too many input files ({0}); the limit is {max}", max = crate::sample::MAX_INPUT_FILES)]
    TooManyFiles(usize),

    #[error("no index path supplied")]
    NoIndex,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
