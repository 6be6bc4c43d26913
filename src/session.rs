//! Session facade: open a decoder with either strategy, one-shot
//! decompression, and a [`std::io::Read`] adapter.

use std::io::{self, Read};

use crate::config::{DecoderOptions, Strategy, Variant};
use crate::decompress::{
    DecodeError, DecodeStatus, IncrementalDecoder, Ppmd7Decoder, Ppmd8Decoder,
    Result as DecodeResult,
};
#[cfg(feature = "thread-bridge")]
use crate::decompress::{ThreadedPpmd7Decoder, ThreadedPpmd8Decoder};
use crate::error::Result;

/// Compressed bytes pulled from the inner reader per refill.
const READ_CHUNK: usize = 64 * 1024;

/// An open decode session: one of the two variants under one of the two
/// strategies.
pub enum DecodeSession {
    Direct(Ppmd7Decoder),
    #[cfg(feature = "thread-bridge")]
    Threaded(ThreadedPpmd7Decoder),
    Direct8(Ppmd8Decoder),
    #[cfg(feature = "thread-bridge")]
    Threaded8(ThreadedPpmd8Decoder),
}

impl DecodeSession {
    fn inner(&self) -> &dyn IncrementalDecoder {
        match self {
            Self::Direct(d) => d,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded(d) => d,
            Self::Direct8(d) => d,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded8(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn IncrementalDecoder {
        match self {
            Self::Direct(d) => d,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded(d) => d,
            Self::Direct8(d) => d,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded8(d) => d,
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Self::Direct(_) | Self::Direct8(_) => Strategy::Resumable,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded(_) | Self::Threaded8(_) => Strategy::ThreadBridge,
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Self::Direct(_) => Variant::Ppmd7,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded(_) => Variant::Ppmd7,
            Self::Direct8(_) => Variant::Ppmd8,
            #[cfg(feature = "thread-bridge")]
            Self::Threaded8(_) => Variant::Ppmd8,
        }
    }
}

impl IncrementalDecoder for DecodeSession {
    fn feed(&mut self, input: &[u8], limit: Option<usize>) -> DecodeResult<Vec<u8>> {
        self.inner_mut().feed(input, limit)
    }

    fn flush(&mut self, length: usize) -> DecodeResult<Vec<u8>> {
        self.inner_mut().flush(length)
    }

    fn needs_input(&self) -> bool {
        self.inner().needs_input()
    }

    fn eof(&self) -> bool {
        self.inner().eof()
    }

    fn unused_data(&self) -> &[u8] {
        self.inner().unused_data()
    }

    fn status(&self) -> DecodeStatus {
        self.inner().status()
    }

    fn total_in(&self) -> u64 {
        self.inner().total_in()
    }

    fn total_out(&self) -> u64 {
        self.inner().total_out()
    }
}

/// Open a resumable session. Order and memory are clamped.
pub fn open(max_order: u32, memory_size: u32) -> DecodeResult<DecodeSession> {
    open_with(&DecoderOptions::new(max_order, memory_size))
}

/// Open a session with full options.
pub fn open_with(options: &DecoderOptions) -> DecodeResult<DecodeSession> {
    let opts = options.clone().clamped();
    log::debug!(
        "opening {:?} session: order {}, memory {}, {:?}",
        opts.variant,
        opts.max_order,
        opts.memory_size,
        opts.strategy
    );
    match (opts.variant, opts.strategy) {
        (Variant::Ppmd7, Strategy::Resumable) => Ok(DecodeSession::Direct(Ppmd7Decoder::new(
            opts.max_order,
            opts.memory_size,
        )?)),
        (Variant::Ppmd8, Strategy::Resumable) => Ok(DecodeSession::Direct8(Ppmd8Decoder::new(
            opts.max_order,
            opts.memory_size,
            opts.restore_method,
        )?)),
        #[cfg(feature = "thread-bridge")]
        (Variant::Ppmd7, Strategy::ThreadBridge) => Ok(DecodeSession::Threaded(
            ThreadedPpmd7Decoder::new(opts.max_order, opts.memory_size)?
                .with_timeouts(opts.poll_interval, opts.max_polls),
        )),
        #[cfg(feature = "thread-bridge")]
        (Variant::Ppmd8, Strategy::ThreadBridge) => Ok(DecodeSession::Threaded8(
            ThreadedPpmd8Decoder::new(opts.max_order, opts.memory_size, opts.restore_method)?
                .with_timeouts(opts.poll_interval, opts.max_polls),
        )),
    }
}

/// Decode a complete stream of `length` bytes in one call.
///
/// Works for streams with or without an end marker.
pub fn decompress(data: &[u8], length: usize, options: &DecoderOptions) -> Result<Vec<u8>> {
    let mut session = open_with(options)?;
    let mut out = session.feed(data, Some(length))?;
    if !session.eof() {
        let rest = length - out.len();
        out.extend(session.flush(rest)?);
    }
    Ok(out)
}

/// [`Read`] adapter decoding a PPMd stream from an inner reader.
///
/// The variant comes from [`DecoderOptions::variant`].
pub struct PpmdReader<R> {
    inner: R,
    session: DecodeSession,
    chunk: Vec<u8>,
}

impl<R: Read> PpmdReader<R> {
    pub fn new(inner: R, options: &DecoderOptions) -> DecodeResult<Self> {
        Ok(Self {
            inner,
            session: open_with(options)?,
            chunk: Vec::new(),
        })
    }

    pub fn session(&self) -> &DecodeSession {
        &self.session
    }

    /// Bytes read from the inner reader past the end of the stream.
    pub fn unused_data(&self) -> &[u8] {
        self.session.unused_data()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self, limit: usize) -> Result<Vec<u8>> {
        if self.session.status() == DecodeStatus::QuotaReached {
            return Ok(self.session.feed(&[], Some(limit))?);
        }
        if self.chunk.is_empty() {
            self.chunk.resize(READ_CHUNK, 0);
        }
        let n = loop {
            match self.inner.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Err(DecodeError::UnexpectedEndOfInput.into());
        }
        Ok(self.session.feed(&self.chunk[..n], Some(limit))?)
    }
}

impl<R: Read> Read for PpmdReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.session.eof() {
                return Ok(0);
            }
            let out = self.fill(buf.len()).map_err(io::Error::from)?;
            if !out.is_empty() {
                buf[..out.len()].copy_from_slice(&out);
                return Ok(out.len());
            }
        }
    }
}

impl From<DecodeSession> for Box<dyn IncrementalDecoder> {
    fn from(session: DecodeSession) -> Self {
        match session {
            DecodeSession::Direct(d) => Box::new(d),
            #[cfg(feature = "thread-bridge")]
            DecodeSession::Threaded(d) => Box::new(d),
            DecodeSession::Direct8(d) => Box::new(d),
            #[cfg(feature = "thread-bridge")]
            DecodeSession::Threaded8(d) => Box::new(d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::ppm::{Ppmd7Encoder, Ppmd8Encoder, RestoreMethod};
    use crate::error::PpmdError;
    use pretty_assertions::assert_eq;

    fn sample() -> Vec<u8> {
        b"It was the best of times, it was the worst of times. ".repeat(40)
    }

    #[test_log::test]
    fn test_open_clamps() {
        let session = open(0, 0).unwrap();
        assert_eq!(session.strategy(), Strategy::Resumable);
        assert_eq!(session.variant(), Variant::Ppmd7);
        assert!(!session.eof());
        assert_eq!(session.total_in(), 0);
    }

    #[test_log::test]
    fn test_decompress_end_marked() {
        let data = sample();
        let packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, true).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20);
        assert_eq!(decompress(&packed, data.len(), &opts).unwrap(), data);
    }

    #[test_log::test]
    fn test_decompress_sized_stream() {
        let data = sample();
        let packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, false).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20);
        assert_eq!(decompress(&packed, data.len(), &opts).unwrap(), data);
    }

    #[test_log::test]
    fn test_decompress_truncated() {
        let data = sample();
        let packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, false).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20);
        let err = decompress(&packed[..packed.len() / 2], data.len(), &opts).unwrap_err();
        assert!(matches!(
            err,
            PpmdError::Decode(DecodeError::UnexpectedEndOfInput)
        ));
    }

    /// Hands out at most three bytes per read.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(3).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test_log::test]
    fn test_reader_small_reads() {
        let data = sample();
        let mut packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, true).unwrap();
        packed.extend_from_slice(b"tail");
        let opts = DecoderOptions::new(6, 1 << 20);
        let mut reader = PpmdReader::new(Trickle(&packed), &opts).unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(reader.session().total_out(), data.len() as u64);
    }

    #[test_log::test]
    fn test_reader_truncated_input() {
        let data = sample();
        let packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, true).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20);
        let mut reader = PpmdReader::new(&packed[..packed.len() - 4], &opts).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(feature = "thread-bridge")]
    #[test_log::test]
    fn test_reader_threaded() {
        let data = sample();
        let packed = Ppmd7Encoder::compress(&data, 6, 1 << 20, true).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20).with_strategy(Strategy::ThreadBridge);
        let mut reader = PpmdReader::new(&packed[..], &opts).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.session().strategy(), Strategy::ThreadBridge);
    }

    #[test_log::test]
    fn test_decompress_ppmd8() {
        let data = sample();
        let packed = Ppmd8Encoder::compress(&data, 8, 1 << 20, RestoreMethod::Restart, true).unwrap();
        let opts = DecoderOptions::new(8, 1 << 20).with_variant(Variant::Ppmd8);
        assert_eq!(decompress(&packed, data.len(), &opts).unwrap(), data);
    }

    #[test_log::test]
    fn test_reader_ppmd8_small_reads() {
        let data = sample();
        let packed = Ppmd8Encoder::compress(&data, 6, 1 << 20, RestoreMethod::CutOff, true).unwrap();
        let opts = DecoderOptions::new(6, 1 << 20)
            .with_variant(Variant::Ppmd8)
            .with_restore_method(RestoreMethod::CutOff);
        let mut reader = PpmdReader::new(Trickle(&packed), &opts).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(reader.session().variant(), Variant::Ppmd8);
    }

    #[cfg(feature = "thread-bridge")]
    #[test_log::test]
    fn test_open_ppmd8_threaded() {
        let opts = DecoderOptions::new(6, 1 << 20)
            .with_variant(Variant::Ppmd8)
            .with_strategy(Strategy::ThreadBridge);
        let session = open_with(&opts).unwrap();
        assert_eq!(session.strategy(), Strategy::ThreadBridge);
        assert_eq!(session.variant(), Variant::Ppmd8);
    }
}
