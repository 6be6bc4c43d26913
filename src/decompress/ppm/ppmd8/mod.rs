//! PPMd var.I revision 1 as used by zip (compression method 98).
//!
//! Based on Dmitry Shkarin's PPMd var.I and Dmitry Subbotin's carryless
//! range coder.

#[cfg(any(test, feature = "test-support"))]
mod encoder;
mod model;
mod range_coder;
mod sub_alloc;

#[cfg(any(test, feature = "test-support"))]
pub use encoder::{Ppmd8Encoder, RangeEncoder as Ppmd8RangeEncoder};
pub use model::Ppmd8Model;
pub use range_coder::{RangeDecoder as Ppmd8RangeDecoder, RangeSnapshot, PREAMBLE_LEN};

/// What the model does when its arena is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMethod {
    /// Throw the statistics away and start over.
    #[default]
    Restart,
    /// Prune the context tree until a quarter of the arena is free, falling
    /// back to a restart when less than half of it was in use.
    CutOff,
}
