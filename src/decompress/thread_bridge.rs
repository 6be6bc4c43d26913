//! Worker-thread decoding strategy.
//!
//! The model runs a plain blocking decode loop on its own thread. Its byte
//! source parks the thread whenever the input runs dry, after telling the
//! session so; `feed` hands over the next chunk and waits for the worker to
//! park again, hit the output limit, or finish.
//!
//! ```text
//!  session                         worker
//!  -------                         ------
//!  feed ── Job::Feed ───────────▶  decode ... input empty
//!       ◀──────── Reply::NeedInput ──┘  (parked in next_byte)
//!  feed ── Job::Feed ───────────▶  resume mid-symbol ... limit reached
//!       ◀──────── Reply::Quota ──────┘  (parked between symbols)
//!  feed ── Job::Feed ───────────▶  ... end marker
//!       ◀──────── Reply::End ────────┘  (thread exits)
//! ```
//!
//! Every wait on the session side is bounded by `poll_interval * max_polls`.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::input::ByteSource;
use super::ppm::{
    Ppmd7Model, Ppmd8Model, RangeCoder, RestoreMethod, Step, SymbolModel, PPMD7_MAX_MEM_SIZE,
    PPMD7_MAX_ORDER, PPMD7_MIN_MEM_SIZE, PPMD7_MIN_ORDER, PPMD8_MAX_MEM_SIZE, PPMD8_MAX_ORDER,
    PPMD8_MIN_MEM_SIZE, PPMD8_MIN_ORDER,
};
use super::{Corruption, DecodeError, DecodeStatus, IncrementalDecoder, Result};

/// Default wait between liveness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default number of liveness checks before giving up on the worker.
pub const DEFAULT_MAX_POLLS: u32 = 2000;

/// Request from the session to the worker.
enum Job {
    Feed { data: Vec<u8>, limit: Option<usize> },
    Flush { length: usize },
    Stop,
}

/// Worker answer to one job.
enum Reply {
    NeedInput { out: Vec<u8> },
    Quota { out: Vec<u8> },
    End { out: Vec<u8>, unused: Vec<u8> },
    Error(DecodeError),
}

/// Blocking byte source owned by the worker.
struct Feeder {
    jobs: Receiver<Job>,
    replies: Sender<Reply>,
    stop: Arc<AtomicBool>,
    input: Vec<u8>,
    pos: usize,
    /// Input position at the start of the current symbol.
    mark: usize,
    /// `code` at the start of the current symbol, while one is half read.
    start_code: Option<u32>,
    out: Vec<u8>,
    limit: Option<usize>,
    flushing: bool,
    stopped: bool,
}

impl Feeder {
    fn quota_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.out.len() >= limit)
    }

    fn reply(&mut self, reply: Reply) {
        if self.replies.send(reply).is_err() {
            self.stopped = true;
        }
    }

    /// Append a chunk, dropping input no retry can need any more.
    fn load(&mut self, data: Vec<u8>, limit: Option<usize>) {
        if self.mark > 0 {
            self.input.drain(..self.mark);
            self.pos -= self.mark;
            self.mark = 0;
        }
        if self.input.is_empty() {
            self.input = data;
        } else {
            self.input.extend_from_slice(&data);
        }
        self.limit = limit;
    }

    /// Park until a job brings input. Returns `false` when told to stop.
    ///
    /// Zero-limit feeds that arrive mid-symbol are answered here: the
    /// symbol cannot be delivered, so the call ends with nothing.
    fn wait_for_input(&mut self) -> bool {
        loop {
            let job = match self.jobs.recv() {
                Ok(job) => job,
                Err(_) => Job::Stop,
            };
            if self.stop.load(Ordering::Acquire) {
                self.stopped = true;
                return false;
            }
            match job {
                Job::Stop => {
                    self.stopped = true;
                    return false;
                }
                Job::Feed { data, limit } => {
                    self.load(data, limit);
                    if limit == Some(0) && self.start_code.is_some() {
                        self.reply(Reply::Quota { out: Vec::new() });
                        if self.stopped {
                            return false;
                        }
                        continue;
                    }
                    return true;
                }
                Job::Flush { length } => {
                    self.flushing = true;
                    self.limit = Some(length);
                    if length == 0 {
                        if let Some(code) = self.start_code {
                            self.finish_at_symbol_start(code);
                            return false;
                        }
                    }
                    return true;
                }
            }
        }
    }

    /// End a zero-length flush that arrived while a symbol was half read.
    fn finish_at_symbol_start(&mut self, code: u32) {
        let reply = if code == 0 {
            Reply::End {
                out: Vec::new(),
                unused: self.input[self.mark..].to_vec(),
            }
        } else {
            Reply::Error(Corruption::EndMarkNotConfirmed { code }.into())
        };
        self.reply(reply);
        self.stopped = true;
    }
}

impl ByteSource for Feeder {
    fn next_byte(&mut self) -> Option<u8> {
        loop {
            if let Some(&byte) = self.input.get(self.pos) {
                self.pos += 1;
                return Some(byte);
            }
            if self.flushing || self.stopped {
                return None;
            }
            let out = mem::take(&mut self.out);
            self.reply(Reply::NeedInput { out });
            if self.stopped || !self.wait_for_input() {
                return None;
            }
        }
    }
}

/// Thread-side state: the model and everything it reads from.
struct Worker<M: SymbolModel> {
    model: M,
    rc: M::Coder,
    feeder: Feeder,
}

impl<M: SymbolModel> Worker<M> {
    fn run(mut self) {
        log::debug!("{} worker started", M::NAME);
        if self.feeder.wait_for_input() {
            self.decode();
        }
        log::debug!("{} worker exiting", M::NAME);
    }

    fn finish(&mut self) {
        let feeder = &mut self.feeder;
        let reply = if self.rc.is_finished_ok() {
            Reply::End {
                out: mem::take(&mut feeder.out),
                unused: feeder.input[feeder.pos..].to_vec(),
            }
        } else {
            Reply::Error(
                Corruption::EndMarkNotConfirmed {
                    code: self.rc.code(),
                }
                .into(),
            )
        };
        feeder.reply(reply);
    }

    /// A flush reached its length: accept a clean boundary or a trailing end
    /// marker.
    fn finish_flush(&mut self) {
        if !self.rc.is_finished_ok() {
            let code = self.rc.code();
            let step = self.model.decode_symbol(&mut self.rc, &mut self.feeder);
            if step != Step::EndOfStream || !self.rc.is_finished_ok() {
                self.feeder
                    .reply(Reply::Error(Corruption::EndMarkNotConfirmed { code }.into()));
                return;
            }
        }
        self.finish();
    }

    fn decode(&mut self) {
        if let Err(e) = self.rc.init(&mut self.feeder) {
            match Corruption::from_preamble(e) {
                Some(c) => self.feeder.reply(Reply::Error(c.into())),
                None if !self.feeder.stopped => self
                    .feeder
                    .reply(Reply::Error(DecodeError::UnexpectedEndOfInput)),
                None => {}
            }
            return;
        }

        loop {
            if self.feeder.stopped {
                return;
            }
            if self.feeder.quota_reached() {
                if self.feeder.flushing {
                    self.finish_flush();
                    return;
                }
                let out = mem::take(&mut self.feeder.out);
                self.feeder.reply(Reply::Quota { out });
                self.feeder.start_code = None;
                if self.feeder.stopped || !self.feeder.wait_for_input() {
                    return;
                }
                continue;
            }

            self.feeder.mark = self.feeder.pos;
            self.feeder.start_code = Some(self.rc.code());
            match self.model.decode_symbol(&mut self.rc, &mut self.feeder) {
                Step::Symbol(b) => {
                    if self.feeder.out.try_reserve(1).is_err() {
                        let requested = self.feeder.out.len() + 1;
                        self.feeder
                            .reply(Reply::Error(DecodeError::OutOfMemory { requested }));
                        return;
                    }
                    self.feeder.out.push(b);
                }
                Step::NeedMoreInput => {
                    if !self.feeder.stopped {
                        self.feeder
                            .reply(Reply::Error(DecodeError::UnexpectedEndOfInput));
                    }
                    return;
                }
                Step::EndOfStream => {
                    self.finish();
                    return;
                }
                Step::DataError => {
                    self.feeder
                        .reply(Reply::Error(Corruption::ThresholdOutOfRange.into()));
                    return;
                }
            }
        }
    }
}

/// Session side of a running worker.
struct WorkerHandle {
    jobs: Sender<Job>,
    replies: Receiver<Reply>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// PPMd decode session backed by a worker thread.
///
/// Observably identical to [`super::PpmdDecoder`] over the same model; the
/// worker is started on the first `feed` and stopped at end of stream, on
/// error, or on drop.
pub struct ThreadedPpmdDecoder<M: SymbolModel + Send + 'static> {
    /// Handed to the worker when it starts.
    model: Option<M>,
    worker: Option<WorkerHandle>,
    poll_interval: Duration,
    max_polls: u32,
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

/// PPMd var.H (7z) session on a worker thread.
pub type ThreadedPpmd7Decoder = ThreadedPpmdDecoder<Ppmd7Model>;

/// PPMd var.I rev.1 session on a worker thread.
pub type ThreadedPpmd8Decoder = ThreadedPpmdDecoder<Ppmd8Model>;

impl ThreadedPpmdDecoder<Ppmd7Model> {
    /// Open a session. Order and memory are clamped to the PPMd7 limits.
    pub fn new(max_order: u32, memory_size: u32) -> Result<Self> {
        let max_order = max_order.clamp(PPMD7_MIN_ORDER, PPMD7_MAX_ORDER);
        let memory_size = memory_size.clamp(PPMD7_MIN_MEM_SIZE, PPMD7_MAX_MEM_SIZE);
        log::debug!(
            "opening threaded PPMd7 decoder: order {}, memory {} bytes",
            max_order,
            memory_size
        );
        Ok(Self::with_model(Ppmd7Model::new(max_order, memory_size)?))
    }
}

impl ThreadedPpmdDecoder<Ppmd8Model> {
    /// Open a session. Order and memory are clamped to the PPMd8 limits.
    pub fn new(max_order: u32, memory_size: u32, restore: RestoreMethod) -> Result<Self> {
        let max_order = max_order.clamp(PPMD8_MIN_ORDER, PPMD8_MAX_ORDER);
        let memory_size = memory_size.clamp(PPMD8_MIN_MEM_SIZE, PPMD8_MAX_MEM_SIZE);
        log::debug!(
            "opening threaded PPMd8 decoder: order {}, memory {} bytes, restore {:?}",
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

impl<M: SymbolModel + Send + 'static> ThreadedPpmdDecoder<M> {
    /// Drive an already constructed model once the first chunk arrives.
    pub fn with_model(model: M) -> Self {
        Self {
            model: Some(model),
            worker: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
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

    /// Set the bounded-wait parameters of the handshake.
    pub fn with_timeouts(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls.max(1);
        self
    }

    /// Whether a worker thread is currently attached.
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    fn spawn(&mut self) -> Result<()> {
        let Some(model) = self.model.take() else {
            return Err(DecodeError::WorkerLost);
        };
        let (job_tx, job_rx) = bounded(1);
        let (reply_tx, reply_rx) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let feeder = Feeder {
            jobs: job_rx,
            replies: reply_tx,
            stop: Arc::clone(&stop),
            input: Vec::new(),
            pos: 0,
            mark: 0,
            start_code: None,
            out: Vec::new(),
            limit: None,
            flushing: false,
            stopped: false,
        };
        let thread = thread::Builder::new()
            .name(format!("{}-decoder", M::NAME.to_ascii_lowercase()))
            .spawn(move || {
                let worker = Worker {
                    model,
                    rc: M::Coder::default(),
                    feeder,
                };
                worker.run()
            })
            .map_err(DecodeError::WorkerSpawn)?;
        self.worker = Some(WorkerHandle {
            jobs: job_tx,
            replies: reply_rx,
            stop,
            thread,
        });
        Ok(())
    }

    /// Send one job and wait, bounded, for its reply.
    fn round_trip(&mut self, job: Job) -> Result<Reply> {
        if self.worker.is_none() {
            self.spawn()?;
        }
        let Some(worker) = self.worker.as_ref() else {
            return Err(DecodeError::WorkerLost);
        };
        worker
            .jobs
            .send_timeout(job, self.poll_interval * self.max_polls)
            .map_err(|_| DecodeError::WorkerLost)?;

        for _ in 0..self.max_polls {
            match worker.replies.recv_timeout(self.poll_interval) {
                Ok(reply) => return Ok(reply),
                Err(RecvTimeoutError::Timeout) => {
                    if worker.thread.is_finished() && worker.replies.is_empty() {
                        return Err(DecodeError::WorkerLost);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(DecodeError::WorkerLost),
            }
        }
        Err(DecodeError::WorkerUnresponsive {
            polls: self.max_polls,
        })
    }

    /// Stop and join the worker, giving up after the sanity bound.
    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        let _ = worker.jobs.try_send(Job::Stop);
        drop(worker.jobs);
        // A worker blocked on an unread reply sees the disconnect.
        drop(worker.replies);

        let deadline = Instant::now() + self.poll_interval * self.max_polls;
        let step = self.poll_interval.min(Duration::from_millis(1));
        while !worker.thread.is_finished() {
            if Instant::now() >= deadline {
                log::error!(
                    "{} worker did not stop within {} polls, detaching it",
                    M::NAME,
                    self.max_polls
                );
                return;
            }
            thread::sleep(step);
        }
        if worker.thread.join().is_err() {
            log::error!("{} worker panicked", M::NAME);
        }
    }

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
        self.shutdown();
        err
    }

    /// Apply a worker reply to the session state.
    fn settle(&mut self, reply: Reply) -> Result<Vec<u8>> {
        let (out, status) = match reply {
            Reply::NeedInput { out } => (out, DecodeStatus::NeedInput),
            Reply::Quota { out } => (out, DecodeStatus::QuotaReached),
            Reply::End { out, unused } => {
                self.unused = unused;
                self.eof = true;
                self.total_out += out.len() as u64;
                log::debug!(
                    "{} stream ended: {} bytes in, {} bytes out, {} unused",
                    M::NAME,
                    self.total_in,
                    self.total_out,
                    self.unused.len()
                );
                self.shutdown();
                self.needs_input = false;
                self.status = DecodeStatus::End;
                return Ok(out);
            }
            Reply::Error(e) => return Err(self.fail(e)),
        };
        self.total_out += out.len() as u64;
        self.needs_input = status == DecodeStatus::NeedInput;
        self.status = status;
        log::trace!("feed -> {:?}: {} bytes out", status, out.len());
        Ok(out)
    }
}

impl<M: SymbolModel + Send + 'static> IncrementalDecoder for ThreadedPpmdDecoder<M> {
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
        if input.is_empty() && self.total_in == 0 {
            return Err(DecodeError::NotEnoughHeaderInput);
        }

        self.total_in += input.len() as u64;
        log::trace!("feed: {} new bytes, limit {:?}", input.len(), limit);
        let job = Job::Feed {
            data: input.to_vec(),
            limit,
        };
        match self.round_trip(job) {
            Ok(reply) => self.settle(reply),
            Err(e) => Err(self.fail(e)),
        }
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
            "flushing threaded {} decoder, up to {} more out",
            M::NAME,
            length
        );
        if self.worker.is_none() {
            return Err(self.fail(DecodeError::UnexpectedEndOfInput));
        }
        match self.round_trip(Job::Flush { length }) {
            Ok(reply @ (Reply::End { .. } | Reply::Error(_))) => self.settle(reply),
            Ok(_) => Err(self.fail(DecodeError::WorkerLost)),
            Err(e) => Err(self.fail(e)),
        }
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

impl<M: SymbolModel + Send + 'static> Drop for ThreadedPpmdDecoder<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::ppm::{Ppmd7Encoder, Ppmd8Encoder};

    fn encode(data: &[u8]) -> Vec<u8> {
        Ppmd7Encoder::compress(data, 6, 1 << 20, true).unwrap()
    }

    fn decoder() -> ThreadedPpmd7Decoder {
        ThreadedPpmd7Decoder::new(6, 1 << 20).unwrap()
    }

    #[test_log::test]
    fn test_worker_starts_lazily_and_stops_at_end() {
        let packed = encode(b"lazy worker");
        let mut dec = decoder();
        assert!(!dec.has_worker());
        let out = dec.feed(&packed, None).unwrap();
        assert_eq!(out, b"lazy worker");
        assert!(dec.eof());
        assert!(!dec.has_worker());
    }

    #[test_log::test]
    fn test_drop_while_parked() {
        let packed = encode(b"parked mid stream");
        let mut dec = decoder();
        dec.feed(&packed[..7], None).unwrap();
        assert!(dec.needs_input());
        assert!(dec.has_worker());
        let started = Instant::now();
        drop(dec);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test_log::test]
    fn test_zero_limit_mid_symbol() {
        let packed = encode(b"zero quota");
        let mut dec = decoder();
        let mut out = dec.feed(&packed[..6], None).unwrap();
        assert!(dec.needs_input());
        assert!(dec.feed(&packed[6..8], Some(0)).unwrap().is_empty());
        assert_eq!(dec.status(), DecodeStatus::QuotaReached);
        assert!(!dec.needs_input());
        out.extend(dec.feed(&packed[8..], None).unwrap());
        assert_eq!(out, b"zero quota");
        assert!(dec.eof());
    }

    #[test_log::test]
    fn test_bad_preamble() {
        let mut dec = decoder();
        let err = dec.feed(&[1, 2, 3, 4, 5, 6], None).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::DataCorruption(Corruption::BadPreamble(1))
        ));
        assert!(dec.eof());
        assert!(!dec.has_worker());
        assert!(matches!(
            dec.feed(&[], None),
            Err(DecodeError::SessionFinished)
        ));
        assert!(matches!(dec.flush(0), Err(DecodeError::SessionFinished)));
    }

    #[test_log::test]
    fn test_ppmd8_worker_thread() {
        let text = b"worker thread, var.I model, worker thread";
        let packed = Ppmd8Encoder::compress(text, 6, 1 << 20, RestoreMethod::Restart, true).unwrap();
        let mut dec = ThreadedPpmd8Decoder::new(6, 1 << 20, RestoreMethod::Restart).unwrap();
        let mut out = Vec::new();
        for chunk in packed.chunks(5) {
            out.extend(dec.feed(chunk, None).unwrap());
        }
        assert_eq!(out, text);
        assert!(dec.eof());
        assert!(!dec.has_worker());
    }

    #[test]
    fn test_flush_before_any_input() {
        let mut dec = decoder();
        assert!(matches!(
            dec.flush(10),
            Err(DecodeError::UnexpectedEndOfInput)
        ));
        assert!(dec.eof());
    }
}
