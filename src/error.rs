use thiserror::Error;

/// Errors surfaced by the storage engine.
///
/// Every variant is either fatal to the operation that produced it (`Io`,
/// `DataCorruption`, `UnsupportedVersion`, `InvalidMetadata`) or a rejection
/// of an otherwise well-formed request (`Overwrite`, `DataOutranked`,
/// `ValueAdopted`, `IllegalArgument`). Nothing here is swallowed internally;
/// callers decide how to react.
#[derive(Debug, Error)]
pub enum Error {
    #[error("segment {segment} is corrupt: {reason}")]
    DataCorruption { segment: u64, reason: &'static str },

    #[error("address {address} already has a value and no rank was supplied")]
    Overwrite { address: u64 },

    #[error("address {address} is already decided at rank ({value}, {uuid})")]
    ValueAdopted { address: u64, value: u64, uuid: String },

    #[error("append at address {address} outranked by existing rank ({value}, {uuid})")]
    DataOutranked { address: u64, value: u64, uuid: String },

    #[error("{0}")]
    IllegalArgument(&'static str),

    #[error("unsupported segment version {found}, expected {expected}")]
    UnsupportedVersion { found: i32, expected: i32 },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
