//! PPMd (Prediction by Partial Matching) models and their range decoders.
//!
//! | Module | Variant | Container | Range coder | Preamble |
//! |--------|---------|-----------|-------------|----------|
//! | [`ppmd7`] | var.H | 7z | 7z coder, carries resolved by the encoder | 5 bytes, lead byte 0 |
//! | [`ppmd8`] | var.I rev.1 | zip | carryless Subbotin coder | 4 bytes |
//!
//! A model is reached through [`SymbolModel`]: one call decodes one symbol.
//! A call that runs out of input leaves the model exactly as it found it, so
//! the caller can restore the range decoder from a [`RangeCoder::snapshot`]
//! and retry once more bytes arrive.

pub mod ppmd7;
pub mod ppmd8;

#[cfg(any(test, feature = "test-support"))]
pub use ppmd7::{Ppmd7Encoder, RangeEncoder};
pub use ppmd7::{Ppmd7Model, RangeDecoder, RangeSnapshot, PREAMBLE_LEN};
#[cfg(any(test, feature = "test-support"))]
pub use ppmd8::{Ppmd8Encoder, Ppmd8RangeEncoder};
pub use ppmd8::{Ppmd8Model, Ppmd8RangeDecoder, RestoreMethod};

use super::input::ByteSource;

/// Smallest accepted PPMd7 model order.
pub const PPMD7_MIN_ORDER: u32 = 2;
/// Largest accepted PPMd7 model order.
pub const PPMD7_MAX_ORDER: u32 = 64;
/// Smallest accepted PPMd7 model memory.
pub const PPMD7_MIN_MEM_SIZE: u32 = 1 << 11;
/// Largest accepted PPMd7 model memory.
pub const PPMD7_MAX_MEM_SIZE: u32 = 0xFFFF_FFFF - 12 * 3;

/// Smallest accepted PPMd8 model order.
pub const PPMD8_MIN_ORDER: u32 = 2;
/// Largest accepted PPMd8 model order.
pub const PPMD8_MAX_ORDER: u32 = 16;
/// Smallest accepted PPMd8 model memory.
pub const PPMD8_MIN_MEM_SIZE: u32 = 1 << 11;
/// Largest accepted PPMd8 model memory.
pub const PPMD8_MAX_MEM_SIZE: u32 = 0xFFFF_FFFF - 12 * 3;

/// Why a range decoder could not make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The byte source is empty right now.
    NeedMore,
    /// The first 7z preamble byte was not zero.
    BadPreamble(u8),
    /// The PPMd8 preamble decoded to `code == 0xFFFF_FFFF`.
    BadInitialCode,
}

/// Outcome of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A decoded byte.
    Symbol(u8),
    /// The end marker (an escape out of the order-0 context).
    EndOfStream,
    /// The byte source ran dry mid-symbol. The model is unchanged.
    NeedMoreInput,
    /// The stream is corrupt.
    DataError,
}

/// Arithmetic decoder state shared by every variant.
///
/// Preamble bytes are committed as they arrive. Everything after the
/// preamble is retried symbol by symbol through [`snapshot`](Self::snapshot)
/// and [`restore`](Self::restore).
pub trait RangeCoder: Default {
    /// Register copy taken before each symbol.
    type Snapshot: Copy + std::fmt::Debug;

    /// Bytes in the stream preamble.
    const PREAMBLE_LEN: u8;

    /// Pull preamble bytes from `src` until the header is complete.
    fn init<S: ByteSource>(&mut self, src: &mut S) -> Result<(), RangeError>;

    /// Whether the preamble has been fully consumed.
    fn is_ready(&self) -> bool;

    /// Number of preamble bytes consumed so far.
    fn header_bytes_consumed(&self) -> u8;

    /// Current `code` register. Zero after the last symbol of a clean stream.
    fn code(&self) -> u32;

    /// True when the stream ended exactly on a symbol boundary.
    #[inline]
    fn is_finished_ok(&self) -> bool {
        self.code() == 0
    }

    fn snapshot(&self) -> Self::Snapshot;

    fn restore(&mut self, snap: Self::Snapshot);
}

/// Opaque probability model driven by the decode controller.
pub trait SymbolModel {
    /// Range decoder this model reads through.
    type Coder: RangeCoder;

    /// Short variant name for log lines.
    const NAME: &'static str;

    /// Decode one symbol, pulling bytes from `src` through `rc`.
    ///
    /// On [`Step::NeedMoreInput`] the model has rolled back its own state;
    /// the caller owns rolling back `rc` and `src`.
    fn decode_symbol<S: ByteSource>(&mut self, rc: &mut Self::Coder, src: &mut S) -> Step;

    /// Reset to the freshly constructed state.
    fn restart(&mut self);
}
