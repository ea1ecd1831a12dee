// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The error type shared by every fallible operation in this crate.

use thiserror::Error;

/// Errors produced by the loss-recovery and crypto-stream-reassembly core.
///
/// None of these are used for expected, recoverable conditions (a negative
/// RTT sample, a spurious timer fire): those are absorbed locally and only
/// logged. Every variant here is fatal to the connection that produced it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The peer sent conflicting bytes at the same stream offset, or some
    /// other frame violated a protocol invariant this crate enforces.
    #[error("protocol violation")]
    ProtocolViolation,

    /// The upper-layer message parser rejected a reassembled message.
    #[error("crypto stream parse error: {0}")]
    Parse(String),

    /// More bytes were buffered waiting to become contiguous than the
    /// configured per-space limit allows.
    #[error("crypto stream buffer exceeded")]
    CryptoBufferExceeded,

    /// An operation was attempted against a packet-number space that has
    /// already been discarded.
    #[error("packet number space already discarded")]
    SpaceDiscarded,
}

/// The result type used throughout this crate.
pub type Res<T> = Result<T, Error>;
