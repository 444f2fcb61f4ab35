#![forbid(unsafe_code)]
#![cfg_attr(not(feature = "std"), no_std)]

//! # canfray
//!
//! A bit-level CAN 2.0 / CAN FD injection toolkit: a bit-accurate wire
//! encoder plus a hard real-time engine that bit-bangs frames onto a
//! TX/RX pin pair and carries out protocol-level attacks that exploit
//! arbitration and error-signalling semantics.
//!
//! The crate targets security research on busses you are authorised to
//! test: desynchronising receivers, spoofing targeted identifiers and
//! forcing error handling are exactly the behaviours a resilient network
//! design has to survive.
//!
//! ## Features
//!
//! - **100% safe Rust** - `#![forbid(unsafe_code)]`
//! - **no_std support** - the encoder and engine run on bare-metal
//!   targets with no allocator
//! - **Bit-accurate encoding**: dynamic stuff bits, CAN FD fixed stuff
//!   bits, Gray-coded stuff count, CRC15/17/21, self-driven ACK
//! - **Five attack primitives**: plain transmit, Janus
//!   dual-interpretation transmit, targeted spoof, error-passive
//!   overwrite, error-frame injection
//! - **Portable**: one [`Platform`] trait abstracts the cycle counter,
//!   the two pins and the calibrated bit timing; timing resolves at
//!   compile time
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `std` | Yes | `std::error::Error` for [`Error`]. The core never needs it. |
//! | `serde` | No | Serde derives on the descriptor types. |
//! | `defmt` | No | `defmt::Format` derives for firmware logging. |
//!
//! ## Quick Start
//!
//! ```ignore
//! use canfray::{FdFlags, FrameSlot, FrameSpec, Injector};
//!
//! // `PicoPort` is your board's `Platform` implementation
//! let mut injector = Injector::new(PicoPort::new());
//! injector.set_timeout(20_000_000);
//!
//! // Encode and transmit a classic frame, retrying twice on lost
//! // arbitration
//! let spec = FrameSpec::classic(0x123).with_data(&[0xA5]);
//! injector.set_frame(FrameSlot::First, &spec)?;
//! let sent = injector.send_frame(2, FrameSlot::First);
//!
//! // Target that identifier on the bus and overwrite the next
//! // occurrence past its arbitration field
//! injector.set_attack_masks()?;
//! let spoofed = injector.spoof_frame_error_passive(0);
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`frame`] | Frame descriptors and the wire encoder |
//! | [`engine`] | The bit engine and attack primitives |
//! | [`platform`] | The hardware port trait and wrap-safe time helpers |
//! | [`fd`] | CAN FD DLC table and flags |
//! | [`error`] | Error types and [`Result`] alias |
//!
//! ## Real-time caveat
//!
//! Engine primitives are busy loops with cycle-accurate deadlines. Call
//! them with interrupts masked and do not share their core with other
//! work; see the [`engine`] module docs for the full contract.

pub mod engine;
pub mod error;
pub mod fd;
pub mod frame;
pub mod platform;

mod crc;

pub use engine::{AttackMasks, FrameSlot, Injector};
pub use error::{Error, Result};
pub use fd::{dlc_to_len, len_to_dlc, FdFlags, MAX_FD_DATA_LEN};
pub use frame::{EncodedFrame, FrameSpec, MAX_BITS};
pub use platform::{advance, reached, Platform};
