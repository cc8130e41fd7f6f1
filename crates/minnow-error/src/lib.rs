#![forbid(unsafe_code)]
//! Unified error type for the minnow block layer.
//!
//! Every fallible operation in the workspace returns [`MinnowError`]
//! through the [`Result`] alias. The taxonomy is small on purpose:
//!
//! - [`MinnowError::Io`] wraps operating-system failures from the device
//!   backends.
//! - [`MinnowError::Exhausted`] reports a full cache pool. Callers decide
//!   whether to retry, shed load, or fail; the cache itself never aborts.
//! - [`MinnowError::UnknownDevice`], [`MinnowError::OutOfRange`],
//!   [`MinnowError::BufferLength`], and [`MinnowError::ReadOnly`] reject
//!   malformed requests before any state changes.
//! - [`MinnowError::Config`] covers construction-time validation.
//!
//! This crate depends only on `std` and `thiserror`, so any workspace
//! crate can pull it in without cycles.

use thiserror::Error;

/// Errors produced by the minnow block layer.
#[derive(Debug, Error)]
pub enum MinnowError {
    /// Underlying I/O failure from a device backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every slot in the cache pool is currently referenced, so no victim
    /// could be found for a miss.
    #[error("buffer cache exhausted: all {pool_slots} slots are referenced")]
    Exhausted { pool_slots: usize },

    /// The request named a device that was never registered.
    #[error("unknown device: {device}")]
    UnknownDevice { device: u32 },

    /// The requested block lies past the end of the device.
    #[error("block {block} out of range: device has {blocks} blocks")]
    OutOfRange { block: u64, blocks: u64 },

    /// Caller-supplied buffer does not match the device block size.
    #[error("buffer length mismatch: got {got} bytes, expected {expected}")]
    BufferLength { got: usize, expected: usize },

    /// Write attempted on a device opened read-only.
    #[error("device is read-only")]
    ReadOnly,

    /// Invalid configuration supplied at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, MinnowError>;
