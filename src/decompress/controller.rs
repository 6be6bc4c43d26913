//! Resumable PPMd decoding driven entirely from `feed`.
//!
//! Each call builds an [`InputWindow`] (the caller's chunk, or the carry-over
//! with the chunk appended), decodes until the output limit, the model
//! starving or the end marker, and then stores whatever the window did not
//! consume. A starved symbol is retried from scratch: the range decoder and
//! the window position are snapshotted before every symbol and the model
//! rolls back its own state.

use std::mem;

use super::input::{CarryBuffer, InputWindow};
use super::output::OutputSink;
use super::ppm::{
    Ppmd7Model, Ppmd8Model, RangeCoder, RestoreMethod, Step, SymbolModel, PPMD7_MAX_MEM_SIZE,
    PPMD7_MAX_ORDER, PPMD7_MIN_MEM_SIZE, PPMD7_MIN_ORDER, PPMD8_MAX_MEM_SIZE, PPMD8_MAX_ORDER,
    PPMD8_MIN_MEM_SIZE, PPMD8_MIN_ORDER,
};
use super::{Corruption, DecodeError, DecodeStatus, IncrementalDecoder, Result};

/// Direct (single-threaded) PPMd decode session over any [`SymbolModel`].
pub struct PpmdDecoder<M: SymbolModel> {
    model: M,
    rc: M::Coder,
    /// Undecoded input kept between calls.
    carry: CarryBuffer,
    /// Bytes after the end marker, fixed once `eof` is set.
    unused: Vec<u8>,
    eof: bool,
    needs_input: bool,
    flushed: bool,
    /// Set by the first fatal error; every later call is refused.
    failed: bool,
    status: DecodeStatus,
    total_in: u64,
    total_out: u64,
}

/// PPMd var.H (7z) session.
pub type Ppmd7Decoder = PpmdDecoder<Ppmd7Model>;

/// PPMd var.I rev.1 session.
pub type Ppmd8Decoder = PpmdDecoder<Ppmd8Model>;

impl PpmdDecoder<Ppmd7Model> {
    /// Open a session. Order and memory are clamped to the PPMd7 limits.
    pub fn new(max_order: u32, memory_size: u32) -> Result<Self> {
        let max_order = max_order.clamp(PPMD7_MIN_ORDER, PPMD7_MAX_ORDER);
        let memory_size = memory_size.clamp(PPMD7_MIN_MEM_SIZE, PPMD7_MAX_MEM_SIZE);
        log::debug!(
            "opening PPMd7 decoder: order {}, memory {} bytes",
            max_order,
            memory_size
        );
        Ok(Self::with_model(Ppmd7Model::new(max_order, memory_size)?))
    }
}

impl PpmdDecoder<Ppmd8Model> {
    /// Open a session. Order and memory are clamped to the PPMd8 limits.
    pub fn new(max_order: u32, memory_size: u32, restore: RestoreMethod) -> Result<Self> {
        let max_order = max_order.clamp(PPMD8_MIN_ORDER, PPMD8_MAX_ORDER);
        let memory_size = memory_size.clamp(PPMD8_MIN_MEM_SIZE, PPMD8_MAX_MEM_SIZE);
        log::debug!(
            "opening PPMd8 decoder: order {}, memory {} bytes, restore {:?}",
            max_order,
            memory_size,
            restore
        );
        Ok(Self::with_model(Ppmd8Model::new(
            max_order,
            memory_size,
            restore,
        )?))
    }
}

impl<M: SymbolModel> PpmdDecoder<M> {
    /// Drive an already constructed model.
    pub fn with_model(model: M) -> Self {
        Self {
            model,
            rc: M::Coder::default(),
            carry: CarryBuffer::new(),
            unused: Vec::new(),
            eof: false,
            needs_input: false,
            flushed: false,
            failed: false,
            status: DecodeStatus::Idle,
            total_in: 0,
            total_out: 0,
        }
    }

    /// Bytes currently retained between calls.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Decode symbols from `win` into `sink` until one of the stop reasons.
    fn decode_into(&mut self, win: &mut InputWindow<'_>, sink: &mut OutputSink) -> Result<DecodeStatus> {
        if !self.rc.is_ready() {
            if let Err(e) = self.rc.init(win) {
                return match Corruption::from_preamble(e) {
                    Some(c) => Err(c.into()),
                    None => Ok(DecodeStatus::NeedInput),
                };
            }
        }

        loop {
            if sink.is_full() {
                return Ok(DecodeStatus::QuotaReached);
            }
            let snap = self.rc.snapshot();
            let mark = win.position();
            match self.model.decode_symbol(&mut self.rc, win) {
                Step::Symbol(b) => sink.push(b)?,
                Step::NeedMoreInput => {
                    self.rc.restore(snap);
                    win.set_position(mark);
                    return Ok(DecodeStatus::NeedInput);
                }
                Step::EndOfStream => {
                    if !self.rc.is_finished_ok() {
                        return Err(Corruption::EndMarkNotConfirmed {
                            code: self.rc.code(),
                        }
                        .into());
                    }
                    return Ok(DecodeStatus::End);
                }
                Step::DataError => return Err(Corruption::ThresholdOutOfRange.into()),
            }
        }
    }

    /// Mark the session dead after a fatal error.
    fn fail(&mut self, err: DecodeError) -> DecodeError {
        if let DecodeError::DataCorruption(c) = &err {
            log::warn!(
                "{} stream corrupt after {} bytes out: {}",
                M::NAME,
                self.total_out,
                c
            );
        }
        self.failed = true;
        self.eof = true;
        self.needs_input = false;
        self.carry.clear();
        err
    }

    /// Record the end of the stream; `rest` becomes the unused data.
    fn finish_stream(&mut self, rest: &[u8]) -> Result<()> {
        self.unused
            .try_reserve_exact(rest.len())
            .map_err(|_| DecodeError::OutOfMemory {
                requested: rest.len(),
            })?;
        self.unused.extend_from_slice(rest);
        self.carry.clear();
        self.eof = true;
        self.needs_input = false;
        log::debug!(
            "{} stream ended: {} bytes in, {} bytes out, {} unused",
            M::NAME,
            self.total_in,
            self.total_out,
            self.unused.len()
        );
        Ok(())
    }

    fn run_feed(&mut self, input: &[u8], limit: Option<usize>) -> Result<Vec<u8>> {
        let mut sink = OutputSink::new(limit);
        let mut carry = mem::take(&mut self.carry);

        let status = if carry.is_empty() {
            // Common path: decode straight from the caller's chunk.
            let mut win = InputWindow::borrowed(input);
            self.trace_window(&win, limit);
            let decoded = self.decode_into(&mut win, &mut sink);
            self.total_out += sink.len() as u64;
            let status = decoded?;
            if status == DecodeStatus::End {
                self.finish_stream(win.rest())?;
            } else {
                let rest = win.rest();
                carry
                    .store_suffix(rest)
                    .map_err(|_| DecodeError::OutOfMemory {
                        requested: rest.len(),
                    })?;
            }
            status
        } else {
            let requested = carry.len() + input.len();
            carry
                .append(input)
                .map_err(|_| DecodeError::OutOfMemory { requested })?;
            let mut win = InputWindow::from_carry(carry.as_slice());
            self.trace_window(&win, limit);
            let decoded = self.decode_into(&mut win, &mut sink);
            self.total_out += sink.len() as u64;
            let status = decoded?;
            let consumed = win.position();
            if status == DecodeStatus::End {
                self.finish_stream(win.rest())?;
                carry.clear();
            } else {
                carry.consume(consumed);
            }
            status
        };

        self.carry = carry;
        self.needs_input = status == DecodeStatus::NeedInput;
        self.status = status;
        log::trace!(
            "feed -> {:?}: {} bytes out, {} carried",
            status,
            sink.len(),
            self.carry.len()
        );
        Ok(sink.finish())
    }

    fn trace_window(&self, win: &InputWindow<'_>, limit: Option<usize>) {
        log::trace!(
            "feed: window {} bytes ({:?}), limit {:?}",
            win.len(),
            win.source(),
            limit
        );
    }

    /// A flush stopped at its length: the stream must end right here, either
    /// on a clean boundary or with the end marker as the next symbol.
    fn confirm_end(&mut self, win: &mut InputWindow<'_>) -> Result<()> {
        if self.rc.is_finished_ok() {
            return Ok(());
        }
        let code = self.rc.code();
        match self.model.decode_symbol(&mut self.rc, win) {
            Step::EndOfStream if self.rc.is_finished_ok() => Ok(()),
            _ => Err(Corruption::EndMarkNotConfirmed { code }.into()),
        }
    }

    fn run_flush(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut sink = OutputSink::new(Some(length));
        let mut carry = mem::take(&mut self.carry);
        let mut win = InputWindow::from_carry(carry.as_slice());

        let decoded = self.decode_into(&mut win, &mut sink);
        self.total_out += sink.len() as u64;
        match decoded? {
            DecodeStatus::End => {}
            DecodeStatus::NeedInput => return Err(DecodeError::UnexpectedEndOfInput),
            _ => self.confirm_end(&mut win)?,
        }
        self.finish_stream(win.rest())?;
        carry.clear();
        self.carry = carry;
        self.status = DecodeStatus::End;
        Ok(sink.finish())
    }
}

impl<M: SymbolModel> IncrementalDecoder for PpmdDecoder<M> {
    fn feed(&mut self, input: &[u8], limit: Option<usize>) -> Result<Vec<u8>> {
        if self.flushed || self.failed {
            return Err(DecodeError::SessionFinished);
        }
        if self.eof {
            if input.is_empty() {
                self.status = DecodeStatus::End;
                return Ok(Vec::new());
            }
            return Err(DecodeError::AlreadyFinished);
        }
        if input.is_empty() && self.carry.is_empty() && self.rc.header_bytes_consumed() == 0 {
            return Err(DecodeError::NotEnoughHeaderInput);
        }

        self.total_in += input.len() as u64;
        self.run_feed(input, limit).map_err(|e| self.fail(e))
    }

    fn flush(&mut self, length: usize) -> Result<Vec<u8>> {
        if self.flushed || self.failed {
            return Err(DecodeError::SessionFinished);
        }
        self.flushed = true;
        if self.eof {
            return Ok(Vec::new());
        }
        log::debug!(
            "flushing {} decoder: {} carried bytes, up to {} more out",
            M::NAME,
            self.carry.len(),
            length
        );
        self.run_flush(length).map_err(|e| self.fail(e))
    }

    fn needs_input(&self) -> bool {
        self.needs_input && !self.eof
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn unused_data(&self) -> &[u8] {
        &self.unused
    }

    fn status(&self) -> DecodeStatus {
        self.status
    }

    fn total_in(&self) -> u64 {
        self.total_in
    }

    fn total_out(&self) -> u64 {
        self.total_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::ppm::{Ppmd7Encoder, Ppmd8Encoder};

    fn encode(data: &[u8]) -> Vec<u8> {
        Ppmd7Encoder::compress(data, 6, 1 << 20, true).unwrap()
    }

    fn decoder() -> Ppmd7Decoder {
        Ppmd7Decoder::new(6, 1 << 20).unwrap()
    }

    #[test]
    fn test_new_clamps_parameters() {
        let dec = Ppmd7Decoder::new(1, 10).unwrap();
        assert_eq!(dec.model.max_order(), PPMD7_MIN_ORDER);
        assert_eq!(dec.model.mem_size(), PPMD7_MIN_MEM_SIZE);
        let dec = Ppmd7Decoder::new(100, 1 << 16).unwrap();
        assert_eq!(dec.model.max_order(), PPMD7_MAX_ORDER);
    }

    #[test]
    fn test_single_call() {
        let packed = encode(b"hello hello hello");
        let mut dec = decoder();
        let out = dec.feed(&packed, None).unwrap();
        assert_eq!(out, b"hello hello hello");
        assert!(dec.eof());
        assert!(!dec.needs_input());
        assert_eq!(dec.status(), DecodeStatus::End);
        assert!(dec.unused_data().is_empty());
        assert_eq!(dec.total_in(), packed.len() as u64);
        assert_eq!(dec.total_out(), 17);
    }

    #[test]
    fn test_partial_header_is_carried() {
        let packed = encode(b"xyz");
        let mut dec = decoder();
        assert!(dec.feed(&packed[..3], None).unwrap().is_empty());
        assert!(dec.needs_input());
        assert_eq!(dec.carry_len(), 0);
        let out = dec.feed(&packed[3..], None).unwrap();
        assert_eq!(out, b"xyz");
        assert!(dec.eof());
    }

    #[test]
    fn test_starved_symbol_bytes_stay_in_carry() {
        let packed = encode(b"abracadabra");
        let mut dec = decoder();
        let mut out = dec.feed(&packed[..6], None).unwrap();
        assert!(dec.needs_input());
        assert!(dec.carry_len() <= 1);
        out.extend(dec.feed(&packed[6..], None).unwrap());
        assert_eq!(out, b"abracadabra");
    }

    #[test]
    fn test_empty_first_feed() {
        let mut dec = decoder();
        assert!(matches!(
            dec.feed(&[], None),
            Err(DecodeError::NotEnoughHeaderInput)
        ));
        assert!(!dec.eof());
        assert_eq!(dec.status(), DecodeStatus::Idle);
    }

    #[test]
    fn test_flush_twice() {
        let packed = encode(b"q");
        let mut dec = decoder();
        dec.feed(&packed, None).unwrap();
        assert!(dec.flush(0).unwrap().is_empty());
        assert!(matches!(dec.flush(0), Err(DecodeError::SessionFinished)));
        assert!(matches!(
            dec.feed(&[], None),
            Err(DecodeError::SessionFinished)
        ));
    }

    #[test]
    fn test_failed_session_refuses_every_call() {
        let mut dec = decoder();
        assert!(dec.feed(&[1, 2, 3, 4, 5], None).is_err());
        assert!(dec.failed);
        assert!(matches!(
            dec.feed(&[], None),
            Err(DecodeError::SessionFinished)
        ));
        assert!(matches!(
            dec.feed(&[0], None),
            Err(DecodeError::SessionFinished)
        ));
        assert!(matches!(dec.flush(0), Err(DecodeError::SessionFinished)));
    }

    #[test]
    fn test_ppmd8_clamps_and_decodes() {
        let dec = Ppmd8Decoder::new(40, 10, RestoreMethod::Restart).unwrap();
        assert_eq!(dec.model.max_order(), PPMD8_MAX_ORDER);
        assert_eq!(dec.model.mem_size(), PPMD8_MIN_MEM_SIZE);

        let packed =
            Ppmd8Encoder::compress(b"hello hello hello", 6, 1 << 20, RestoreMethod::Restart, true)
                .unwrap();
        let mut dec = Ppmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart).unwrap();
        let out = dec.feed(&packed, None).unwrap();
        assert_eq!(out, b"hello hello hello");
        assert!(dec.eof());
        assert_eq!(dec.total_in(), packed.len() as u64);
    }
}
