//! Session configuration.

use std::time::Duration;

use crate::decompress::ppm::{
    RestoreMethod, PPMD7_MAX_MEM_SIZE, PPMD7_MAX_ORDER, PPMD7_MIN_MEM_SIZE, PPMD7_MIN_ORDER,
    PPMD8_MAX_MEM_SIZE, PPMD8_MAX_ORDER, PPMD8_MIN_MEM_SIZE, PPMD8_MIN_ORDER,
};

/// PPMd flavour of the compressed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    /// var.H with the 7z range coder.
    #[default]
    Ppmd7,
    /// var.I rev.1 with the carryless range coder (zip).
    Ppmd8,
}

/// How a session turns the model's one-symbol primitive into chunked decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Resumable state machine; all work happens inside `feed`.
    #[default]
    Resumable,
    /// Blocking decode loop on a worker thread.
    #[cfg(feature = "thread-bridge")]
    ThreadBridge,
}

/// Options for opening a decode session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderOptions {
    pub variant: Variant,
    /// Model order, clamped to `2..=64` (PPMd7) or `2..=16` (PPMd8).
    pub max_order: u32,
    /// Model arena size in bytes.
    pub memory_size: u32,
    /// Arena exhaustion handling. PPMd8 only.
    pub restore_method: RestoreMethod,
    pub strategy: Strategy,
    /// Wait between worker liveness checks (thread bridge only).
    pub poll_interval: Duration,
    /// Liveness checks before the worker is declared unresponsive.
    pub max_polls: u32,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            max_order: 6,
            memory_size: 16 << 20,
            restore_method: RestoreMethod::default(),
            strategy: Strategy::default(),
            poll_interval: Duration::from_millis(50),
            max_polls: 2000,
        }
    }
}

impl DecoderOptions {
    pub fn new(max_order: u32, memory_size: u32) -> Self {
        Self {
            max_order,
            memory_size,
            ..Self::default()
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_restore_method(mut self, restore_method: RestoreMethod) -> Self {
        self.restore_method = restore_method;
        self
    }

    pub fn with_max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    pub fn with_memory_size(mut self, memory_size: u32) -> Self {
        self.memory_size = memory_size;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls;
        self
    }

    /// Bring every field into its accepted range.
    pub fn clamped(mut self) -> Self {
        let (orders, sizes) = match self.variant {
            Variant::Ppmd7 => (
                (PPMD7_MIN_ORDER, PPMD7_MAX_ORDER),
                (PPMD7_MIN_MEM_SIZE, PPMD7_MAX_MEM_SIZE),
            ),
            Variant::Ppmd8 => (
                (PPMD8_MIN_ORDER, PPMD8_MAX_ORDER),
                (PPMD8_MIN_MEM_SIZE, PPMD8_MAX_MEM_SIZE),
            ),
        };
        self.max_order = self.max_order.clamp(orders.0, orders.1);
        self.memory_size = self.memory_size.clamp(sizes.0, sizes.1);
        self.max_polls = self.max_polls.max(1);
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(1);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = DecoderOptions::default();
        assert_eq!(opts.max_order, 6);
        assert_eq!(opts.memory_size, 16 << 20);
        assert_eq!(opts.strategy, Strategy::Resumable);
        assert_eq!(opts.variant, Variant::Ppmd7);
        assert_eq!(opts.restore_method, RestoreMethod::Restart);
        assert_eq!(opts.clone().clamped(), opts);
    }

    #[test]
    fn test_clamping() {
        let opts = DecoderOptions::new(0, 0)
            .with_max_polls(0)
            .with_poll_interval(Duration::ZERO)
            .clamped();
        assert_eq!(opts.max_order, 2);
        assert_eq!(opts.memory_size, 2048);
        assert_eq!(opts.max_polls, 1);
        assert!(!opts.poll_interval.is_zero());

        let opts = DecoderOptions::new(1000, u32::MAX).clamped();
        assert_eq!(opts.max_order, 64);
        assert_eq!(opts.memory_size, 0xFFFF_FFFF - 36);
    }

    #[test]
    fn test_ppmd8_order_limit() {
        let opts = DecoderOptions::new(64, 1 << 20)
            .with_variant(Variant::Ppmd8)
            .with_restore_method(RestoreMethod::CutOff)
            .clamped();
        assert_eq!(opts.max_order, 16);
        assert_eq!(opts.memory_size, 1 << 20);
        assert_eq!(opts.restore_method, RestoreMethod::CutOff);
    }
}
