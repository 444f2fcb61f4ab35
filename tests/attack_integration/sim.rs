//! A simulated platform: virtual cycle counter, wired-AND bus, and
//! recorded pin activity.

use canfray::{EncodedFrame, Platform};

/// Arbitration-phase bit time in simulated cycles.
pub const BIT: u32 = 64;

/// Data-phase bit time; a quarter of the nominal bit, matching the 4x
/// oversampling the error attack assumes for BRS frames.
pub const BIT_FD: u32 = 16;

/// Where the engine samples inside an arbitration-phase bit.
pub const SAMPLE_OFFSET: u32 = 48;

/// Absolute time of the first transmitted bit when the engine starts on
/// a bus that stays idle from t = 0: ten idle samples, the matching
/// eleventh sample, then the remainder of that bit.
pub const IDLE_START: u64 = SAMPLE_OFFSET as u64 + 10 * BIT as u64 + (BIT - SAMPLE_OFFSET) as u64;

/// Simulated platform. Reading the clock or the RX pin each costs one
/// cycle, so engine loop iterations advance time; `set_tx` acts at the
/// current instant. Engine drive times therefore land within a few
/// cycles of their nominal bit boundaries, and assertions sample
/// mid-bit or allow that slack.
pub struct SimPlatform {
    t: u64,
    clock_base: u64,
    tx: bool,
    tx_log: Vec<(u64, bool)>,
    debug_log: Vec<(u64, bool)>,
    dominant_windows: Vec<(u64, u64)>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            t: 0,
            clock_base: 0,
            tx: true,
            tx_log: vec![(0, true)],
            debug_log: vec![(0, true)],
            dominant_windows: Vec::new(),
        }
    }

    /// Scripts remote (another node's) dominant drive over `[start, end)`.
    pub fn remote_dominant(&mut self, start: u64, end: u64) {
        self.dominant_windows.push((start, end));
    }

    /// Scripts the first `bits` bits of an encoded frame as remote
    /// traffic starting at `start`, one nominal bit time per bit.
    pub fn remote_bits(&mut self, frame: &EncodedFrame, start: u64, bits: usize) {
        for i in 0..bits {
            if !frame.bit(i) {
                let bit_start = start + i as u64 * BIT as u64;
                self.remote_dominant(bit_start, bit_start + BIT as u64);
            }
        }
    }

    fn remote_level(&self, t: u64) -> bool {
        !self
            .dominant_windows
            .iter()
            .any(|&(start, end)| t >= start && t < end)
    }

    /// The engine's driven TX level at time `t`.
    pub fn tx_level_at(&self, t: u64) -> bool {
        self.tx_log
            .iter()
            .rev()
            .find(|&&(at, _)| at <= t)
            .map(|&(_, level)| level)
            .unwrap_or(true)
    }

    /// The mirrored debug-pin level at time `t`.
    pub fn debug_level_at(&self, t: u64) -> bool {
        self.debug_log
            .iter()
            .rev()
            .find(|&&(at, _)| at <= t)
            .map(|&(_, level)| level)
            .unwrap_or(true)
    }

    /// The wired-AND bus level at time `t`: dominant wins.
    pub fn bus_level_at(&self, t: u64) -> bool {
        self.remote_level(t) && self.tx_level_at(t)
    }

    /// The TX level right now.
    pub fn tx_level_now(&self) -> bool {
        self.tx
    }

    /// Instant of the engine's first dominant TX drive.
    pub fn first_dominant_tx(&self) -> Option<u64> {
        self.tx_log
            .iter()
            .find(|&&(_, level)| !level)
            .map(|&(at, _)| at)
    }

    /// Contiguous dominant TX drive intervals, `[start, end)` each.
    pub fn dominant_tx_spans(&self) -> Vec<(u64, u64)> {
        let mut spans = Vec::new();
        let mut open: Option<u64> = None;
        for &(at, level) in &self.tx_log {
            match (level, open) {
                (false, None) => open = Some(at),
                (true, Some(start)) => {
                    spans.push((start, at));
                    open = None;
                }
                _ => {}
            }
        }
        if let Some(start) = open {
            spans.push((start, u64::MAX));
        }
        spans
    }
}

impl Platform for SimPlatform {
    const BIT_TIME: u32 = BIT;
    const BIT_TIME_FD: u32 = BIT_FD;
    const SAMPLE_POINT_OFFSET: u32 = SAMPLE_OFFSET;
    const SAMPLE_POINT_OFFSET_FD: u32 = 12;
    const FALLING_EDGE_RECALIBRATE: u32 = 0;

    fn now(&mut self) -> u32 {
        let counter = self.t.wrapping_sub(self.clock_base) as u32;
        self.t += 1;
        counter
    }

    fn reset_clock(&mut self, offset: u32) {
        self.clock_base = self.t.wrapping_sub(offset as u64);
    }

    fn set_tx(&mut self, level: bool) {
        if level != self.tx {
            self.tx = level;
            self.tx_log.push((self.t, level));
        }
    }

    fn get_rx(&mut self) -> bool {
        let level = self.remote_level(self.t) && self.tx;
        self.t += 1;
        level
    }

    fn set_debug(&mut self, level: bool) {
        if self.debug_log.last().map(|&(_, l)| l) != Some(level) {
            self.debug_log.push((self.t, level));
        }
    }
}
