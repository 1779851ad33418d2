use thiserror::Error;

/// Crate-wide error type.
///
/// Configuration and restore failures abort the enclosing operation and
/// propagate to the caller. Statistical abstentions and clipped weight
/// updates are recovered locally and only show up in metrics.
#[derive(Debug, Error)]
pub enum EvoError {
    #[error("duplicate unit id `{0}`")]
    DuplicateUnit(String),

    #[error("unknown unit id `{0}`")]
    UnknownUnit(String),

    #[error("no edge `{from}` -> `{to}`")]
    UnknownEdge { from: String, to: String },

    #[error("invalid parameter for `{id}`: {what}")]
    InvalidParameter { id: String, what: &'static str },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("codec error: {0}")]
    Codec(String),
}
