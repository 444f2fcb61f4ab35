//! Error types for frame construction and engine preconditions.
//!
//! This module defines the [`Error`] enum covering every way a frame
//! descriptor can be rejected before encoding, plus the engine's
//! "no frame loaded" precondition. The bit engine itself never returns an
//! `Error`: once a frame is encoded, transmission outcomes (timeout,
//! arbitration loss, no match) are reported as a `bool` because they are
//! expected operational results on a contested bus, not programming errors.

use core::fmt;

/// Errors that can occur while building a frame descriptor or preparing
/// an attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The 11-bit base identifier does not fit in 11 bits.
    IdentifierOutOfRange {
        /// The identifier that was supplied
        id: u16,
        /// The largest permitted value (0x7FF)
        max: u16,
    },

    /// The 18-bit identifier extension does not fit in 18 bits.
    ExtensionOutOfRange {
        /// The extension that was supplied
        id: u32,
        /// The largest permitted value (0x3FFFF)
        max: u32,
    },

    /// The DLC is outside 0..=15.
    DlcOutOfRange(u8),

    /// More payload bytes were supplied than the DLC can carry.
    ///
    /// Shorter payloads are zero-padded to the DLC length; longer ones
    /// are rejected.
    PayloadTooLong {
        /// Bytes the DLC can carry
        capacity: usize,
        /// Bytes that were supplied
        actual: usize,
    },

    /// A remote frame was given payload bytes. Remote frames carry a DLC
    /// but no data field.
    RemoteWithPayload,

    /// A remote frame was flagged as CAN FD. The FD format has no remote
    /// frames.
    RemoteFd,

    /// An engine operation needs a frame slot that has not been loaded.
    FrameNotSet,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentifierOutOfRange { id, max } => {
                write!(f, "identifier {id:#x} exceeds 11-bit maximum {max:#x}")
            }
            Error::ExtensionOutOfRange { id, max } => {
                write!(f, "identifier extension {id:#x} exceeds 18-bit maximum {max:#x}")
            }
            Error::DlcOutOfRange(dlc) => write!(f, "DLC {dlc} is outside 0..=15"),
            Error::PayloadTooLong { capacity, actual } => {
                write!(f, "payload of {actual} bytes exceeds DLC capacity of {capacity} bytes")
            }
            Error::RemoteWithPayload => write!(f, "remote frames carry no data field"),
            Error::RemoteFd => write!(f, "CAN FD has no remote frames"),
            Error::FrameNotSet => write!(f, "no frame loaded in the requested slot"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A specialized Result type for frame and attack preparation.
pub type Result<T> = core::result::Result<T, Error>;
