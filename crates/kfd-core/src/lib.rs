//! # kfd-core
//!
//! Core of a P25 Key Fill Device implementing the TIA-102.AACD-A manual
//! rekeying protocol over the Three-Wire Interface (DATA + SENSE +
//! ground).  A KFD loads traffic keys into two-way radios over a short
//! cable; this crate is everything between the public `keyload` call and
//! the individual bits on the wire.
//!
//! The layers, top to bottom; control flows down on transmit and back up
//! on receive:
//!
//! - **`dispatcher`** – The public API: `keyload`, `keyload_many`,
//!   `erase_key`, `erase_all`, `inventory`, `detect`, plus diagnostics.
//!   Enforces the single-operation invariant and classifies responses.
//! - **`session`** – The handshake state machine: key signature, ready
//!   request/response with bounded retry, KMM exchange, best-effort
//!   teardown.
//! - **`protocol`** – KMM frame assembly and parsing: message vocabulary,
//!   bit-exact field layout, and the Annex-A CRC-16.
//! - **`twi`** – The physical layer: byte frames with reversed data bits
//!   and odd parity, microsecond bit-banged timing, and the line-driver
//!   trait that hardware ports implement.
//!
//! The crate has no GPIO dependencies of its own.  On real hardware you
//! implement [`twi::line::LineDriver`] over your platform's pins and
//! microsecond clock; on a host, [`twi::virt::VirtualWire`] and the
//! scripted [`sim::VirtualRadio`] stand in for the cable and the radio.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod twi;

pub use config::TwiConfig;
pub use dispatcher::{Kfd, KfdHandle};
pub use error::{KfdError, SelfTestFault};
pub use protocol::framer::InventoryReport;
pub use protocol::messages::{KeyItem, OperationStatus, PeerMode};
pub use twi::line::{LineDriver, LineState, StopBitPolarity};
