use std::path::PathBuf;

use thiserror::Error;

/// Errors from reading a sampled profile (`.csprof`) file.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to open profile {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: malformed profile data")]
    Format {
        path: PathBuf,
        #[source]
        source: csprof_format::FormatError,
    },
    #[error("{path}: a node referenced parent id {parent_id}, which was not seen yet")]
    DanglingParent { path: PathBuf, parent_id: u32 },
    #[error("{path}: profile contains no calling-context tree (or no samples were taken)")]
    EmptyTree { path: PathBuf },
}

/// Errors from sample-to-structure correlation. A load module with no
/// matching static structure, or a sample whose address falls outside
/// every known load module, are *not* represented here: both are soft
/// correlation misses, handled by attributing the affected leaves to
/// their load module instead of failing the batch.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("static structure file {path} could not be parsed")]
    StructureParse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from writing an experiment database.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("failed to create experiment database directory {path}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write XML to {path}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::Error,
    },
    #[error("failed to flush experiment XML to {path}")]
    Flush {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy source file {from} to {to}")]
    CopySource {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
