//! Incremental PPMd decompression.
//!
//! Compressed bytes can be supplied in chunks of any size and output can be
//! requested up to a byte limit per call. Two stream flavours are handled:
//!
//! - PPMd var.H ("PPMd7") as written by 7-Zip: a 5-byte range coder
//!   preamble followed by range-coded symbols.
//! - PPMd var.I rev.1 ("PPMd8") as stored in zip (method 98): a 4-byte
//!   carryless range coder preamble followed by symbols. Pick it with
//!   [`DecoderOptions::with_variant`].
//!
//! Either may be terminated by an end marker.
//!
//! ## Features
//! - `thread-bridge` (default) - decode loop on a worker thread, see
//!   [`ThreadedPpmd7Decoder`] and [`ThreadedPpmd8Decoder`]
//! - `test-support` - in-crate PPMd7 and PPMd8 encoders used by tests,
//!   benches and fuzz targets
//!
//! ## Example
//!
//! ```rust,ignore
//! use ppmd_stream::{open, IncrementalDecoder};
//!
//! let mut session = open(6, 16 << 20)?;
//! let mut out = Vec::new();
//! for chunk in packed.chunks(4096) {
//!     out.extend(session.feed(chunk, None)?);
//!     if session.eof() {
//!         break;
//!     }
//! }
//! ```

mod config;
pub mod decompress;
pub mod error;
mod session;

pub use config::{DecoderOptions, Strategy, Variant};
pub use error::PpmdError;
pub use session::{decompress, open, open_with, DecodeSession, PpmdReader};

pub use decompress::{
    DecodeError, DecodeStatus, IncrementalDecoder, Ppmd7Decoder, Ppmd8Decoder, RestoreMethod,
};
#[cfg(feature = "thread-bridge")]
pub use decompress::{ThreadedPpmd7Decoder, ThreadedPpmd8Decoder};
