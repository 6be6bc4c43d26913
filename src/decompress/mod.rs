//! Incremental PPMd decoding.
//!
//! This module turns the model's one-symbol-at-a-time decode primitive into a
//! chunk-fed protocol: callers hand over compressed bytes in pieces of any
//! size and ask for output up to a byte limit.
//!
//! ## Decoders
//!
//! | Decoder | Variant | Strategy | Notes |
//! |---------|---------|----------|-------|
//! | [`Ppmd7Decoder`] | var.H | Resumable state machine | All work happens inside `feed` |
//! | [`Ppmd8Decoder`] | var.I | Resumable state machine | All work happens inside `feed` |
//! | [`ThreadedPpmd7Decoder`] | var.H | Worker thread + channels | Feature `thread-bridge` |
//! | [`ThreadedPpmd8Decoder`] | var.I | Worker thread + channels | Feature `thread-bridge` |
//!
//! All of them implement [`IncrementalDecoder`]. For one variant the two
//! strategies are observably identical.
//!
//! ## Suspension
//!
//! A call ends for exactly one reason:
//!
//! | Status | Meaning | `needs_input()` | `eof()` |
//! |--------|---------|-----------------|---------|
//! | [`DecodeStatus::QuotaReached`] | Output limit met | false | false |
//! | [`DecodeStatus::NeedInput`] | Ran out of compressed bytes | true | false |
//! | [`DecodeStatus::End`] | End marker decoded | false | true |
//!
//! ## Architecture
//!
//! ```text
//! feed(chunk, limit)
//!       ↓
//! ┌──────────────┐
//! │ InputWindow  │ ← chunk, or carry-over + chunk
//! └──────────────┘
//!       ↓
//! ┌──────────────┐
//! │ RangeCoder   │ ← 5-byte (7z) or 4-byte (var.I) preamble
//! └──────────────┘
//!       ↓
//! ┌──────────────┐
//! │ SymbolModel  │ ← one symbol per step, rolled back when starved
//! └──────────────┘
//!       ↓
//! ┌──────────────┐
//! │ OutputSink   │ ← bounded by the limit
//! └──────────────┘
//! ```

mod controller;
pub mod input;
mod output;
pub mod ppm;
#[cfg(feature = "thread-bridge")]
mod thread_bridge;


pub use controller::{Ppmd7Decoder, Ppmd8Decoder, PpmdDecoder};
pub use input::{ByteSource, CarryBuffer, InputWindow};
pub use output::OutputSink;
pub use ppm::{
    Ppmd7Model, Ppmd8Model, Ppmd8RangeDecoder, RangeCoder, RangeDecoder, RestoreMethod, Step,
    SymbolModel,
};
#[cfg(feature = "thread-bridge")]
pub use thread_bridge::{ThreadedPpmd7Decoder, ThreadedPpmd8Decoder, ThreadedPpmdDecoder};

use std::fmt;
use std::io;

/// Ways a stream can be malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The first 7z preamble byte must be zero.
    BadPreamble(u8),
    /// A var.I preamble may not start the decoder at `code == 0xFFFF_FFFF`.
    BadInitialCode,
    /// A decoded count fell outside the context's total frequency.
    ThresholdOutOfRange,
    /// The stream ended but the range decoder still held a residue.
    EndMarkNotConfirmed { code: u32 },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPreamble(b) => write!(f, "bad stream preamble byte 0x{:02x}", b),
            Self::BadInitialCode => write!(f, "bad stream preamble code 0xffffffff"),
            Self::ThresholdOutOfRange => write!(f, "symbol threshold out of range"),
            Self::EndMarkNotConfirmed { code } => {
                write!(f, "stream ended with residual code 0x{:08x}", code)
            }
        }
    }
}

/// Decoding errors.
#[derive(Debug)]
pub enum DecodeError {
    /// Decoding was requested before any stream byte was supplied.
    ///
    /// Not fatal: the session is untouched.
    NotEnoughHeaderInput,
    /// Malformed compressed data. Fatal.
    DataCorruption(Corruption),
    /// `flush` ran out of input before the stream was complete. Fatal.
    UnexpectedEndOfInput,
    /// A buffer or the model arena could not be allocated. Fatal.
    OutOfMemory { requested: usize },
    /// The worker thread could not be started. Fatal.
    WorkerSpawn(io::Error),
    /// The worker neither progressed nor finished within the bounded wait.
    WorkerUnresponsive { polls: u32 },
    /// The worker thread went away unexpectedly.
    WorkerLost,
    /// Bytes were supplied after the stream had already ended.
    AlreadyFinished,
    /// The session was already flushed, or an earlier call failed fatally.
    SessionFinished,
}

impl DecodeError {
    /// Whether the session must be dropped after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NotEnoughHeaderInput | Self::AlreadyFinished | Self::SessionFinished
        )
    }

    /// Whether this is an internal invariant failure rather than bad input.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::WorkerUnresponsive { .. } | Self::WorkerLost)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughHeaderInput => {
                write!(f, "Not enough data for starting decompression")
            }
            Self::DataCorruption(c) => write!(f, "Corrupt PPMd data: {}", c),
            Self::UnexpectedEndOfInput => write!(f, "Unexpected end of compressed data"),
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory allocating {} bytes", requested)
            }
            Self::WorkerSpawn(e) => write!(f, "Failed to start decoder thread: {}", e),
            Self::WorkerUnresponsive { polls } => {
                write!(f, "Decoder thread did not respond after {} polls", polls)
            }
            Self::WorkerLost => write!(f, "Decoder thread exited unexpectedly"),
            Self::AlreadyFinished => write!(f, "Already at end of stream"),
            Self::SessionFinished => {
                write!(f, "Session is finished (flushed or failed earlier)")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::WorkerSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Corruption> for DecodeError {
    fn from(c: Corruption) -> Self {
        Self::DataCorruption(c)
    }
}

impl Corruption {
    /// Preamble failure reported by a range decoder, if any.
    pub(crate) fn from_preamble(e: ppm::RangeError) -> Option<Self> {
        match e {
            ppm::RangeError::NeedMore => None,
            ppm::RangeError::BadPreamble(b) => Some(Self::BadPreamble(b)),
            ppm::RangeError::BadInitialCode => Some(Self::BadInitialCode),
        }
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Why the last `feed` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeStatus {
    /// Nothing has been decoded yet.
    #[default]
    Idle,
    /// The output limit was reached.
    QuotaReached,
    /// More compressed input is required.
    NeedInput,
    /// The end of the stream was reached.
    End,
}

/// Chunk-fed decoder contract shared by both strategies.
pub trait IncrementalDecoder {
    /// Decode from retained input plus `input`, producing at most `limit`
    /// bytes (`None` for no limit).
    fn feed(&mut self, input: &[u8], limit: Option<usize>) -> Result<Vec<u8>>;

    /// Decode at most `length` more bytes from retained input, treating it as
    /// the end of the stream. Ends the session.
    fn flush(&mut self, length: usize) -> Result<Vec<u8>>;

    /// True iff the last call stopped for lack of input and the stream is
    /// not over.
    fn needs_input(&self) -> bool;

    /// True once the end of the stream has been reached (or a fatal error hit).
    fn eof(&self) -> bool;

    /// Bytes that followed the end marker. Empty until `eof()`.
    fn unused_data(&self) -> &[u8];

    /// Status of the last call.
    fn status(&self) -> DecodeStatus;

    /// Compressed bytes accepted so far.
    fn total_in(&self) -> u64;

    /// Decompressed bytes produced so far.
    fn total_out(&self) -> u64;
}
