//! Crate-level error type.
//!
//! Session operations return [`DecodeError`] directly. [`PpmdError`] is what
//! the reader adapter and the one-shot helpers return, since those also
//! touch an inner [`std::io::Read`].
//!
//! ## Error Categories
//!
//! | Category | Errors | Description |
//! |----------|--------|-------------|
//! | Stream | [`Decode`] with [`DataCorruption`] | Malformed PPMd data |
//! | Session | [`Decode`] with [`NotEnoughHeaderInput`], [`AlreadyFinished`] | Misuse, session intact |
//! | Resources | [`Decode`] with [`OutOfMemory`], worker errors | Session must be dropped |
//! | I/O | [`Io`] | Inner reader failed |
//!
//! ## Example
//!
//! ```rust,ignore
//! use ppmd_stream::{decompress, DecoderOptions, PpmdError};
//!
//! match decompress(&packed, 1024, &DecoderOptions::default()) {
//!     Ok(data) => println!("{} bytes", data.len()),
//!     Err(PpmdError::Decode(e)) if !e.is_fatal() => eprintln!("retry: {}", e),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```
//!
//! [`Decode`]: PpmdError::Decode
//! [`Io`]: PpmdError::Io
//! [`DataCorruption`]: crate::decompress::DecodeError::DataCorruption
//! [`NotEnoughHeaderInput`]: crate::decompress::DecodeError::NotEnoughHeaderInput
//! [`AlreadyFinished`]: crate::decompress::DecodeError::AlreadyFinished
//! [`OutOfMemory`]: crate::decompress::DecodeError::OutOfMemory

use std::fmt;
use std::io;

use crate::decompress::DecodeError;

/// Error type for PPMd operations.
#[derive(Debug)]
pub enum PpmdError {
    /// The decode session failed.
    Decode(DecodeError),

    /// An I/O error occurred.
    ///
    /// Wraps [`std::io::Error`] from the reader behind a [`crate::PpmdReader`].
    Io(io::Error),
}

impl PpmdError {
    /// Whether the session that produced this error must be dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Decode(e) => e.is_fatal(),
            Self::Io(_) => true,
        }
    }
}

impl fmt::Display for PpmdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "PPMd decode error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for PpmdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for PpmdError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for PpmdError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<PpmdError> for io::Error {
    fn from(e: PpmdError) -> Self {
        match e {
            PpmdError::Io(e) => e,
            PpmdError::Decode(DecodeError::UnexpectedEndOfInput) => {
                io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string())
            }
            PpmdError::Decode(DecodeError::OutOfMemory { .. }) => {
                io::Error::new(io::ErrorKind::OutOfMemory, e.to_string())
            }
            PpmdError::Decode(_) => io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PpmdError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::Corruption;

    #[test]
    fn test_io_conversion_kinds() {
        let e: io::Error = PpmdError::from(DecodeError::UnexpectedEndOfInput).into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error =
            PpmdError::from(DecodeError::DataCorruption(Corruption::BadPreamble(3))).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
        assert!(e.to_string().contains("0x03"));

        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let e: io::Error = PpmdError::from(inner).into();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_fatality() {
        assert!(!PpmdError::from(DecodeError::NotEnoughHeaderInput).is_fatal());
        assert!(PpmdError::from(DecodeError::WorkerLost).is_fatal());

        assert!(DecodeError::WorkerUnresponsive { polls: 3 }.is_internal());
        assert!(!DecodeError::DataCorruption(Corruption::ThresholdOutOfRange).is_internal());
    }
}
