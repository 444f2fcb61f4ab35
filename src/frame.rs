//! Frame descriptors and the bit-accurate wire encoder.
//!
//! [`FrameSpec`] describes a CAN 2.0 or CAN FD frame the way an
//! application thinks about it: identifier, DLC, payload, format flags.
//! [`EncodedFrame::encode`] turns that into the exact transmitted bit
//! sequence — SOF through inter-frame space, with dynamic stuff bits,
//! CAN FD fixed stuff bits, the Gray-coded stuff count, the frame CRC
//! and a self-driven ACK slot — plus the index landmarks the bit engine
//! steers by.
//!
//! # Encoding rules
//!
//! - Dynamic bit stuffing runs from SOF through the last CRC bit: after
//!   five consecutive equal bits, one complementary stuff bit is
//!   inserted.
//! - Classic CAN excludes stuff bits from the CRC; CAN FD includes them.
//! - CAN FD replaces the dynamic stuff bit after the final payload bit
//!   with a fixed stuff bit, then emits the 3-bit Gray-coded stuff count
//!   and its parity bit bracketed by fixed stuff bits, then the CRC with
//!   a fixed stuff bit after every fourth CRC bit.
//! - The ACK slot is emitted dominant so a lone device self-acknowledges
//!   and keeps receiver state machines locked to the frame.

use core::fmt;

use crate::crc::Crc;
use crate::error::{Error, Result};
use crate::fd::{dlc_to_len, len_to_dlc, FdFlags, MAX_FD_DATA_LEN};

/// Capacity of an encoded bitstream.
///
/// Sized for the worst case: an extended-identifier CAN FD frame with 64
/// payload bytes, maximal dynamic stuffing, fixed stuff bits, CRC21 and
/// trailing fields. A classic frame never exceeds 160 bits.
pub const MAX_BITS: usize = 768;

/// Sentinel landmark value for "this frame has no BRS bit".
pub(crate) const NO_BRS: usize = MAX_BITS;

/// Largest 11-bit identifier.
const MAX_ID_A: u16 = 0x7FF;

/// Largest 18-bit identifier extension.
const MAX_ID_B: u32 = 0x3FFFF;

/// Descriptor for a frame to encode.
///
/// Constructed with [`FrameSpec::classic`] or [`FrameSpec::extended`] and
/// refined with the chainable setters:
///
/// ```
/// use canfray::{FdFlags, FrameSpec};
///
/// let classic = FrameSpec::classic(0x123).with_data(&[0xA5]);
/// let fd = FrameSpec::classic(0x7FF)
///     .with_data(&[0; 64])
///     .with_fd(FdFlags::new(true, false));
/// assert_eq!(fd.dlc(), 15);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameSpec {
    id_a: u16,
    id_b: u32,
    ide: bool,
    rtr: bool,
    dlc: u8,
    #[cfg_attr(feature = "serde", serde(with = "serde_payload"))]
    data: [u8; MAX_FD_DATA_LEN],
    data_len: usize,
    fd: Option<FdFlags>,
}

impl FrameSpec {
    /// A standard (11-bit identifier) data frame with no payload.
    pub const fn classic(id_a: u16) -> Self {
        Self {
            id_a,
            id_b: 0,
            ide: false,
            rtr: false,
            dlc: 0,
            data: [0; MAX_FD_DATA_LEN],
            data_len: 0,
            fd: None,
        }
    }

    /// An extended (29-bit identifier) data frame with no payload.
    ///
    /// `id_a` is the 11-bit base, `id_b` the 18-bit extension.
    pub const fn extended(id_a: u16, id_b: u32) -> Self {
        Self {
            id_a,
            id_b,
            ide: true,
            rtr: false,
            dlc: 0,
            data: [0; MAX_FD_DATA_LEN],
            data_len: 0,
            fd: None,
        }
    }

    /// Builds a descriptor from any [`embedded_can::Frame`].
    pub fn from_can_frame(frame: &impl embedded_can::Frame) -> Self {
        let mut spec = match frame.id() {
            embedded_can::Id::Standard(id) => Self::classic(id.as_raw()),
            embedded_can::Id::Extended(id) => {
                Self::extended((id.as_raw() >> 18) as u16, id.as_raw() & MAX_ID_B)
            }
        };
        if frame.is_remote_frame() {
            spec.rtr = true;
            spec.dlc = frame.dlc() as u8;
        } else {
            spec = spec.with_data(frame.data());
            spec.dlc = frame.dlc() as u8;
        }
        spec
    }

    /// Sets the payload and derives the minimum covering DLC.
    ///
    /// Payloads shorter than the DLC's data length are zero-padded on
    /// encode. Payloads over 64 bytes are rejected when encoding.
    pub fn with_data(mut self, data: &[u8]) -> Self {
        let stored = data.len().min(MAX_FD_DATA_LEN);
        self.data[..stored].copy_from_slice(&data[..stored]);
        self.data_len = data.len();
        self.dlc = len_to_dlc(data.len());
        self
    }

    /// Overrides the DLC. Useful for remote frames (which carry a DLC
    /// but no data) and for classic frames with DLC 9..=15, which carry
    /// 8 data bytes.
    pub fn with_dlc(mut self, dlc: u8) -> Self {
        self.dlc = dlc;
        self
    }

    /// Marks the frame as a remote frame. Remote frames carry no data
    /// field and cannot be CAN FD.
    pub fn remote(mut self) -> Self {
        self.rtr = true;
        self
    }

    /// Marks the frame as CAN FD with the given BRS/ESI flags.
    pub fn with_fd(mut self, flags: FdFlags) -> Self {
        self.fd = Some(flags);
        self
    }

    /// The 11-bit base identifier.
    pub fn id_a(&self) -> u16 {
        self.id_a
    }

    /// The 18-bit identifier extension (meaningful for extended frames).
    pub fn id_b(&self) -> u32 {
        self.id_b
    }

    /// True for extended (29-bit identifier) frames.
    pub fn is_extended(&self) -> bool {
        self.ide
    }

    /// True for remote frames.
    pub fn is_remote(&self) -> bool {
        self.rtr
    }

    /// The data length code.
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The FD flags, or `None` for a classic frame.
    pub fn fd(&self) -> Option<FdFlags> {
        self.fd
    }

    /// Number of payload bytes the frame carries on the wire, derived
    /// from DLC, format and the remote flag.
    pub fn payload_len(&self) -> usize {
        if self.rtr {
            0
        } else if self.fd.is_some() && self.dlc > 8 {
            dlc_to_len(self.dlc)
        } else {
            (self.dlc as usize).min(8)
        }
    }

    /// The wire payload, zero-padded to the derived length.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.payload_len()]
    }

    fn validate(&self) -> Result<()> {
        if self.id_a > MAX_ID_A {
            return Err(Error::IdentifierOutOfRange {
                id: self.id_a,
                max: MAX_ID_A,
            });
        }
        if self.ide && self.id_b > MAX_ID_B {
            return Err(Error::ExtensionOutOfRange {
                id: self.id_b,
                max: MAX_ID_B,
            });
        }
        if self.dlc > 15 {
            return Err(Error::DlcOutOfRange(self.dlc));
        }
        if self.rtr {
            if self.fd.is_some() {
                return Err(Error::RemoteFd);
            }
            if self.data_len > 0 {
                return Err(Error::RemoteWithPayload);
            }
        } else {
            let capacity = self.payload_len();
            if self.data_len > capacity {
                return Err(Error::PayloadTooLong {
                    capacity,
                    actual: self.data_len,
                });
            }
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
mod serde_payload {
    use super::MAX_FD_DATA_LEN;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        data: &[u8; MAX_FD_DATA_LEN],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; MAX_FD_DATA_LEN], D::Error> {
        struct PayloadVisitor;

        impl<'de> Visitor<'de> for PayloadVisitor {
            type Value = [u8; MAX_FD_DATA_LEN];

            fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "at most {MAX_FD_DATA_LEN} payload bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                if v.len() > MAX_FD_DATA_LEN {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; MAX_FD_DATA_LEN];
                out[..v.len()].copy_from_slice(v);
                Ok(out)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut out = [0u8; MAX_FD_DATA_LEN];
                let mut len = 0usize;
                while let Some(byte) = seq.next_element::<u8>()? {
                    if len >= MAX_FD_DATA_LEN {
                        return Err(de::Error::invalid_length(len + 1, &self));
                    }
                    out[len] = byte;
                    len += 1;
                }
                Ok(out)
            }
        }

        deserializer.deserialize_bytes(PayloadVisitor)
    }
}

/// A fully encoded wire frame: the transmitted bit sequence from SOF
/// through the inter-frame space, per-bit stuff flags, and the index
/// landmarks the bit engine uses for timing switches and triggers.
#[derive(Clone)]
pub struct EncodedFrame {
    pub(crate) tx_bitstream: [bool; MAX_BITS],
    pub(crate) stuff_bit: [bool; MAX_BITS],
    pub(crate) tx_bits: usize,
    pub(crate) last_arbitration_bit: usize,
    pub(crate) brs_bit: usize,
    pub(crate) last_dlc_bit: usize,
    pub(crate) last_data_bit: usize,
    pub(crate) last_crc_bit: usize,
    pub(crate) last_eof_bit: usize,
    pub(crate) tx_arbitration_bits: usize,
    pub(crate) stuff_count: u32,
    pub(crate) crc: u32,
    pub(crate) fd: bool,
    pub(crate) brs: bool,
}

impl EncodedFrame {
    /// Encodes a descriptor into its wire bitstream.
    ///
    /// Fails only on descriptor validation; an in-range descriptor always
    /// fits [`MAX_BITS`].
    pub fn encode(spec: &FrameSpec) -> Result<Self> {
        spec.validate()?;

        let fd = spec.fd.is_some();
        let flags = spec.fd.unwrap_or_default();
        let brs = fd && flags.brs();
        let esi = fd && flags.esi();
        let dlc = spec.dlc;
        let len = spec.payload_len();
        let data = spec.data();

        let mut enc = Encoder::new(fd, brs, Crc::for_frame(fd, dlc));

        // SOF
        enc.push(false);

        // ID A, MSB first
        for i in (0..11).rev() {
            enc.push(spec.id_a & (1 << i) != 0);
        }

        // RTR for a basic frame, SRR for an extended one, RRS (dominant)
        // for non-extended FD
        enc.push(spec.rtr || spec.ide);
        enc.frame.last_arbitration_bit = enc.frame.tx_bits - 1;

        // IDE
        enc.push(spec.ide);

        if spec.ide {
            // ID B, MSB first
            for i in (0..18).rev() {
                enc.push(spec.id_b & (1 << i) != 0);
            }
            // RTR (RRS for FD); this is now the last arbitration bit
            enc.push(spec.rtr);
            enc.frame.last_arbitration_bit = enc.frame.tx_bits - 1;
        }

        // r1, transmitted recessive as FDF in FD frames; classic basic
        // frames have no r1
        if fd {
            enc.push(true);
        } else if spec.ide {
            enc.push(false);
        }

        // r0 (res in FD frames)
        enc.push(false);

        if fd {
            if brs {
                enc.push(true);
                enc.frame.brs_bit = enc.frame.tx_bits - 1;
            } else {
                enc.push(false);
                enc.frame.brs_bit = NO_BRS;
            }
            // ESI: see FdFlags::esi for the wire polarity
            enc.push(!esi);
        }

        // DLC, MSB first
        for i in (0..4).rev() {
            enc.push(dlc & (1 << i) != 0);
        }
        enc.frame.last_dlc_bit = enc.frame.tx_bits - 1;

        // Data, MSB first within each byte. In FD the final payload bit
        // never takes a dynamic stuff bit: the first fixed stuff bit
        // stands in for it.
        for (i, byte) in data.iter().enumerate() {
            for j in (0..8).rev() {
                if fd && i == len - 1 && j == 0 {
                    enc.stuffing = false;
                }
                enc.push(byte & (1 << j) != 0);
            }
        }
        enc.frame.last_data_bit = enc.frame.tx_bits - 1;

        if !fd {
            // Classic CAN: the CRC covers SOF through the last data bit,
            // excluding stuff bits. The CRC field itself is still subject
            // to dynamic stuffing.
            enc.crcing = false;
            let crc = enc.crc.value();
            for i in (0..15).rev() {
                enc.push(crc & (1 << i) != 0);
            }
        } else {
            enc.push_stuff_count_and_crc();
        }
        enc.frame.last_crc_bit = enc.frame.tx_bits - 1;

        // Stuffing ends with the CRC field
        enc.stuffing = false;

        // CRC delimiter, ACK (driven dominant: self-acknowledge), ACK
        // delimiter
        enc.push(true);
        enc.push(false);
        enc.push(true);

        // EOF
        for _ in 0..7 {
            enc.push(true);
        }
        enc.frame.last_eof_bit = enc.frame.tx_bits - 1;

        // IFS
        for _ in 0..3 {
            enc.push(true);
        }

        enc.frame.tx_arbitration_bits = enc.frame.last_arbitration_bit + 1;
        enc.frame.crc = enc.crc.value();
        Ok(enc.frame)
    }

    /// Length of the encoded bitstream, IFS included.
    pub fn tx_bits(&self) -> usize {
        self.tx_bits
    }

    /// The transmitted level of bit `index`.
    ///
    /// Indices past [`tx_bits`](Self::tx_bits) up to [`MAX_BITS`] read as
    /// dominant; the Janus transmit path relies on that fill when its two
    /// frames differ in length.
    pub fn bit(&self, index: usize) -> bool {
        self.tx_bitstream[index]
    }

    /// True if bit `index` is a stuff bit (dynamic or fixed).
    pub fn is_stuff_bit(&self, index: usize) -> bool {
        self.stuff_bit[index]
    }

    /// Index of the last arbitration-field bit (the RTR/RRS bit).
    pub fn last_arbitration_bit(&self) -> usize {
        self.last_arbitration_bit
    }

    /// Number of bits in SOF plus the arbitration field.
    pub fn tx_arbitration_bits(&self) -> usize {
        self.tx_arbitration_bits
    }

    /// Index of the BRS bit, when the frame switches bit rate.
    pub fn brs_bit(&self) -> Option<usize> {
        if self.brs_bit == NO_BRS {
            None
        } else {
            Some(self.brs_bit)
        }
    }

    /// Index of the last DLC bit.
    pub fn last_dlc_bit(&self) -> usize {
        self.last_dlc_bit
    }

    /// Index of the last data-field bit (the last DLC bit when the frame
    /// carries no data).
    pub fn last_data_bit(&self) -> usize {
        self.last_data_bit
    }

    /// Index of the last CRC-field bit.
    pub fn last_crc_bit(&self) -> usize {
        self.last_crc_bit
    }

    /// Index of the last EOF bit; the three IFS bits follow it.
    pub fn last_eof_bit(&self) -> usize {
        self.last_eof_bit
    }

    /// Number of stuff bits inserted (dynamic and fixed, net of the
    /// stuff-count field convention that excludes the first fixed stuff
    /// bit).
    pub fn stuff_count(&self) -> u32 {
        self.stuff_count
    }

    /// Final CRC register value.
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// True for CAN FD frames.
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// True when the frame requests a data-phase bit-rate switch.
    pub fn has_brs(&self) -> bool {
        self.brs
    }

    fn empty(fd: bool, brs: bool) -> Self {
        Self {
            tx_bitstream: [false; MAX_BITS],
            stuff_bit: [false; MAX_BITS],
            tx_bits: 0,
            last_arbitration_bit: 0,
            brs_bit: NO_BRS,
            last_dlc_bit: 0,
            last_data_bit: 0,
            last_crc_bit: 0,
            last_eof_bit: 0,
            tx_arbitration_bits: 0,
            stuff_count: 0,
            crc: 0,
            fd,
            brs,
        }
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("tx_bits", &self.tx_bits)
            .field("fd", &self.fd)
            .field("brs", &self.brs)
            .field("stuff_count", &self.stuff_count)
            .field("crc", &self.crc)
            .field("last_eof_bit", &self.last_eof_bit)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for EncodedFrame {
    /// Renders the bitstream with stuff bits bracketed, e.g.
    /// `000010[1]0011...`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.tx_bits {
            let bit = if self.tx_bitstream[i] { '1' } else { '0' };
            if self.stuff_bit[i] {
                write!(f, "[{bit}]")?;
            } else {
                write!(f, "{bit}")?;
            }
        }
        Ok(())
    }
}

/// Build state for one encoding pass.
struct Encoder {
    frame: EncodedFrame,
    crc: Crc,
    crcing: bool,
    stuffing: bool,
    dominant_run: u32,
    recessive_run: u32,
    fd: bool,
}

impl Encoder {
    fn new(fd: bool, brs: bool, crc: Crc) -> Self {
        Self {
            frame: EncodedFrame::empty(fd, brs),
            crc,
            crcing: true,
            stuffing: true,
            dominant_run: 0,
            recessive_run: 0,
            fd,
        }
    }

    /// Appends a bit without CRC or stuffing bookkeeping.
    fn push_raw(&mut self, bit: bool, stuff: bool) {
        self.frame.stuff_bit[self.frame.tx_bits] = stuff;
        if stuff {
            self.frame.stuff_count += 1;
        }
        self.frame.tx_bitstream[self.frame.tx_bits] = bit;
        self.frame.tx_bits += 1;
    }

    /// Appends a field bit: steps the CRC while it is being accumulated,
    /// tracks level runs, and inserts a dynamic stuff bit after five
    /// equal bits. FD frames feed dynamic stuff bits into the CRC;
    /// classic frames do not.
    fn push(&mut self, bit: bool) {
        if self.crcing {
            self.crc.update(bit);
        }

        self.push_raw(bit, false);
        if bit {
            self.recessive_run += 1;
            self.dominant_run = 0;
        } else {
            self.dominant_run += 1;
            self.recessive_run = 0;
        }

        if self.stuffing {
            if self.dominant_run >= 5 {
                if self.fd {
                    self.crc.update(true);
                }
                self.push_raw(true, true);
                self.dominant_run = 0;
                self.recessive_run = 1;
            }
            if self.recessive_run >= 5 {
                if self.fd {
                    self.crc.update(false);
                }
                self.push_raw(false, true);
                self.dominant_run = 1;
                self.recessive_run = 0;
            }
        }
    }

    /// CAN FD trailer: first fixed stuff bit, Gray-coded stuff count and
    /// parity, second fixed stuff bit, then the CRC with a fixed stuff
    /// bit after every fourth CRC bit.
    fn push_stuff_count_and_crc(&mut self) {
        // First FSB, complement of the last data-field bit. The landmark
        // moves onto the insertion when it lands on a run of four.
        if self.frame.tx_bitstream[self.frame.last_data_bit] {
            self.push_raw(false, true);
            if self.dominant_run == 4 {
                self.frame.last_data_bit += 1;
            }
        } else {
            self.push_raw(true, true);
            if self.recessive_run == 4 {
                self.frame.last_data_bit += 1;
            }
        }
        // The first FSB is not part of the transmitted stuff count
        self.frame.stuff_count -= 1;

        let gray = gray3((self.frame.stuff_count % 8) as u8);
        let parity = self.frame.stuff_count & 1 == 1;

        for i in (0..3).rev() {
            self.push(gray & (1 << i) != 0);
        }
        self.push(parity);

        // Second FSB, complement of the parity bit
        self.push_raw(!parity, true);

        // The CRC field does not feed the CRC register
        self.crcing = false;

        let width = self.crc.width();
        let crc = self.crc.value();
        for i in 0..width {
            let bit = crc & (1 << (width - 1 - i)) != 0;
            self.push(bit);
            if (i + 1) % 4 == 0 {
                self.push_raw(!bit, true);
            }
        }
    }
}

/// The CAN FD Gray code for the 3-bit stuff count.
const fn gray3(count: u8) -> u8 {
    match count {
        0 => 0b000,
        1 => 0b001,
        2 => 0b011,
        3 => 0b010,
        4 => 0b110,
        5 => 0b111,
        6 => 0b101,
        _ => 0b100,
    }
}
