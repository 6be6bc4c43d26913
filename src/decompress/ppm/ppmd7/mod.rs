//! PPMd var.H as used by 7z.
//!
//! Based on Dmitry Shkarin's PPMd var.H and Igor Pavlov's 7z range coder.

#[cfg(any(test, feature = "test-support"))]
mod encoder;
mod model;
mod range_coder;
mod sub_alloc;

#[cfg(any(test, feature = "test-support"))]
pub use encoder::{Ppmd7Encoder, RangeEncoder};
pub use model::Ppmd7Model;
pub use range_coder::{RangeDecoder, RangeSnapshot, PREAMBLE_LEN};
