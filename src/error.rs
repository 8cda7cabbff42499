//! Closed error taxonomy (§7). Library functions return one of these so
//! callers can match by kind; the coordinator/CLI boundary wraps them in
//! `anyhow::Error` for operator-facing context.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid dataset id `{0}`: does not match <PREFIX>-YYYY-MM-DD-HH-MM-SS-<NNNN>")]
    InvalidId(String),

    #[error("dataset id `{0}` already exists")]
    DuplicateId(String),

    #[error("storage directory `{0}` already contains objects")]
    StorageExists(String),

    #[error("could not parse `{name}`: {reason}")]
    ParseError { name: String, reason: String },

    #[error("unsupported bit depth: {0}")]
    UnsupportedBitDepth(String),

    #[error("variable metadata failed schema validation: {0}")]
    SchemaViolation(String),

    #[error("transient I/O failure after exhausting retry budget: {0}")]
    TransientIo(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("dataset `{0}` not found")]
    DatasetNotFound(String),

    #[error("channel filter `{0}` is not numeric and the dataset's channel names are not a stable label set")]
    ChannelNameNotNumeric(String),

    #[error("destination `{0}` already exists")]
    DestinationExists(String),

    #[error("neither download nor metadata was requested")]
    NothingToDo,

    #[error("catalog invariant violated for dataset `{0}`: {1}")]
    InconsistentCatalog(String, String),

    #[error("transient I/O failure after exhausting retry budget: {0}")]
    TransientIo(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
