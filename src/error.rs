//! Errors raised by the pre-reduce stage.
//!
//! Every variant is fatal to the stage that produced it. Nothing in this
//! crate retries internally; callers decide whether to abort the worker.

/// The type of error that can occur while pre-reducing or exchanging
/// fingerprints.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A Golomb buffer ran out of its declared bit capacity.
    #[error("bit buffer capacity exceeded: need {needed} bits, capacity is {capacity}")]
    Capacity { needed: usize, capacity: usize },

    /// No slot could be found for a new key and no partition may be spilled.
    #[error("hash table full: partition {partition} has no free slot and spilling is disabled")]
    TableFull { partition: usize },

    /// The table was used before `initialize` set its memory limit.
    #[error("hash table used before initialize")]
    NotInitialized,

    /// A parameter is outside its valid domain.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An encoded block does not match its header.
    #[error("malformed block: {0}")]
    MalformedBlock(String),

    /// A stream ended while the reader still expected data.
    #[error("stream closed early, {missing} bytes outstanding")]
    StreamClosed { missing: usize },

    /// A writer was used after it was closed.
    #[error("writer already closed")]
    WriterClosed,

    /// An item was emitted after `close_all`.
    #[error("emitter already closed")]
    EmitterClosed,

    /// A buffer ended in the middle of an item.
    #[error("truncated {what}: needs {needed} bytes, {remaining} remaining")]
    Truncated {
        what: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// An item could not be decoded from its serialized form.
    #[error("decode: {0}")]
    Decode(String),

    /// Local storage failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Spill file encoding failure.
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Spill batch construction failure.
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    /// Some other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
