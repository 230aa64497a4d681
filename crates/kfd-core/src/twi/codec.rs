//! Byte codec for the Three-Wire Interface.
//!
//! On-wire format of a single byte, one bit period each:
//!
//! ```text
//! [start: Busy][8 data bits, LSB first, byte bit-reversed][parity][4 stop bits]
//! ```
//!
//! The data bits carry the *bit-reversed* byte transmitted LSB first, so
//! bit 7 of the original byte is on the wire first.  The parity bit closes
//! the data to odd parity: the number of ones across the eight data bits
//! plus the parity bit is always odd.  Stop-bit polarity is configurable
//! and must match the peer.
//!
//! The ten-bit shift-out runs with interrupts masked so the bit period
//! holds to microsecond accuracy; the inter-byte gap and everything above
//! it runs unmasked.  At the default 4 kbaud the masked window is 3.5 ms.
//!
//! Receive mirrors transmit, with one deliberate wrinkle: when the line is
//! already Busy on entry the peer's start bit is in progress, and sampling
//! begins immediately with no half-bit re-alignment.  Radios answer within
//! hundreds of microseconds of a request, faster than the caller can arm
//! the receiver, and re-aligning against a start edge that has already
//! passed would corrupt the first byte.

use tracing::trace;

use crate::config::TwiConfig;
use crate::error::KfdError;
use crate::twi::line::{LineDriver, LineState, StopBitPolarity};

/// Key signature: continuous Busy announcing the KFD, in microseconds.
pub const KEY_SIG_BUSY_US: u32 = 100_000;

/// Key signature: released Idle tail before the ready request.
pub const KEY_SIG_IDLE_US: u32 = 5_000;

/// Stop bits per byte frame.
const STOP_BITS: u32 = 4;

/// Minimum Idle gap between byte frames, in bit periods.
const INTER_BYTE_GAP_BITS: u32 = 2;

/// Safety ceiling when draining stop bits after a received byte.
const STOP_DRAIN_CEILING_US: u64 = 50_000;

/// Settling time after a multi-byte frame before the peer is expected to
/// respond.
const FRAME_SETTLE_US: u32 = 1_000;

/// 256-entry bit-reversal table: entry `b` is `b` with bit 7 ↔ bit 0,
/// bit 6 ↔ bit 1, and so on.
const BIT_REVERSE: [u8; 256] = [
    0x00, 0x80, 0x40, 0xC0, 0x20, 0xA0, 0x60, 0xE0, 0x10, 0x90, 0x50, 0xD0, 0x30, 0xB0, 0x70, 0xF0,
    0x08, 0x88, 0x48, 0xC8, 0x28, 0xA8, 0x68, 0xE8, 0x18, 0x98, 0x58, 0xD8, 0x38, 0xB8, 0x78, 0xF8,
    0x04, 0x84, 0x44, 0xC4, 0x24, 0xA4, 0x64, 0xE4, 0x14, 0x94, 0x54, 0xD4, 0x34, 0xB4, 0x74, 0xF4,
    0x0C, 0x8C, 0x4C, 0xCC, 0x2C, 0xAC, 0x6C, 0xEC, 0x1C, 0x9C, 0x5C, 0xDC, 0x3C, 0xBC, 0x7C, 0xFC,
    0x02, 0x82, 0x42, 0xC2, 0x22, 0xA2, 0x62, 0xE2, 0x12, 0x92, 0x52, 0xD2, 0x32, 0xB2, 0x72, 0xF2,
    0x0A, 0x8A, 0x4A, 0xCA, 0x2A, 0xAA, 0x6A, 0xEA, 0x1A, 0x9A, 0x5A, 0xDA, 0x3A, 0xBA, 0x7A, 0xFA,
    0x06, 0x86, 0x46, 0xC6, 0x26, 0xA6, 0x66, 0xE6, 0x16, 0x96, 0x56, 0xD6, 0x36, 0xB6, 0x76, 0xF6,
    0x0E, 0x8E, 0x4E, 0xCE, 0x2E, 0xAE, 0x6E, 0xEE, 0x1E, 0x9E, 0x5E, 0xDE, 0x3E, 0xBE, 0x7E, 0xFE,
    0x01, 0x81, 0x41, 0xC1, 0x21, 0xA1, 0x61, 0xE1, 0x11, 0x91, 0x51, 0xD1, 0x31, 0xB1, 0x71, 0xF1,
    0x09, 0x89, 0x49, 0xC9, 0x29, 0xA9, 0x69, 0xE9, 0x19, 0x99, 0x59, 0xD9, 0x39, 0xB9, 0x79, 0xF9,
    0x05, 0x85, 0x45, 0xC5, 0x25, 0xA5, 0x65, 0xE5, 0x15, 0x95, 0x55, 0xD5, 0x35, 0xB5, 0x75, 0xF5,
    0x0D, 0x8D, 0x4D, 0xCD, 0x2D, 0xAD, 0x6D, 0xED, 0x1D, 0x9D, 0x5D, 0xDD, 0x3D, 0xBD, 0x7D, 0xFD,
    0x03, 0x83, 0x43, 0xC3, 0x23, 0xA3, 0x63, 0xE3, 0x13, 0x93, 0x53, 0xD3, 0x33, 0xB3, 0x73, 0xF3,
    0x0B, 0x8B, 0x4B, 0xCB, 0x2B, 0xAB, 0x6B, 0xEB, 0x1B, 0x9B, 0x5B, 0xDB, 0x3B, 0xBB, 0x7B, 0xFB,
    0x07, 0x87, 0x47, 0xC7, 0x27, 0xA7, 0x67, 0xE7, 0x17, 0x97, 0x57, 0xD7, 0x37, 0xB7, 0x77, 0xF7,
    0x0F, 0x8F, 0x4F, 0xCF, 0x2F, 0xAF, 0x6F, 0xEF, 0x1F, 0x9F, 0x5F, 0xDF, 0x3F, 0xBF, 0x7F, 0xFF,
];

/// Reverses the bit order of a byte.
pub fn bit_reverse(byte: u8) -> u8 {
    BIT_REVERSE[usize::from(byte)]
}

/// Parity bit for a byte: 1 when the byte's population count is even, so
/// that data bits plus parity always carry an odd number of ones.
pub fn parity_bit(byte: u8) -> u8 {
    (byte.count_ones() as u8 + 1) & 1
}

/// Byte-level transmit/receive over one [`LineDriver`].
pub struct TwiCodec<L: LineDriver> {
    line: L,
    tx_bit_period_us: u32,
    rx_bit_period_us: u32,
    stop_bits: StopBitPolarity,
}

impl<L: LineDriver> TwiCodec<L> {
    /// Creates a codec over `line` with timing taken from `config`.
    ///
    /// SENSE is asserted immediately, matching reference fill devices:
    /// the radio is held in keyload mode from initialisation onward.
    pub fn new(mut line: L, config: &TwiConfig) -> Self {
        line.release_idle();
        line.sense_connect();
        Self {
            line,
            tx_bit_period_us: config.tx_bit_period_us(),
            rx_bit_period_us: config.rx_bit_period_us(),
            stop_bits: config.stop_bits,
        }
    }

    /// Changes the transmit speed.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] when `kbaud` is outside `1..=9`.
    pub fn set_tx_kbaud(&mut self, kbaud: u8) -> Result<(), KfdError> {
        if !(1..=9).contains(&kbaud) {
            return Err(KfdError::InvalidConfig(format!(
                "tx_kbaud must be 1..=9, got {kbaud}"
            )));
        }
        self.tx_bit_period_us = 1000 / u32::from(kbaud);
        Ok(())
    }

    /// Changes the receive speed.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] when `kbaud` is outside `1..=9`.
    pub fn set_rx_kbaud(&mut self, kbaud: u8) -> Result<(), KfdError> {
        if !(1..=9).contains(&kbaud) {
            return Err(KfdError::InvalidConfig(format!(
                "rx_kbaud must be 1..=9, got {kbaud}"
            )));
        }
        self.rx_bit_period_us = 1000 / u32::from(kbaud);
        Ok(())
    }

    /// The underlying line driver, for diagnostics and self test.
    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    /// True when the DATA wire reads Idle.
    pub fn line_is_idle(&mut self) -> bool {
        self.line.sample() == LineState::Idle
    }

    /// True when the DATA wire reads Busy.
    pub fn line_is_busy(&mut self) -> bool {
        self.line.sample() == LineState::Busy
    }

    /// True when SENSE reads connected.
    pub fn peer_connected(&mut self) -> bool {
        self.line.sense_is_connected()
    }

    /// Busy-waits through the line driver's clock.
    pub fn delay_us(&mut self, us: u32) {
        self.line.delay_us(us);
    }

    /// Emits the key signature: 100 ms of continuous Busy followed by 5 ms
    /// of Idle, announcing the KFD to the radio.
    ///
    /// The caller must send the ready request immediately afterwards; the
    /// radio answers within hundreds of microseconds once the signature
    /// ends.
    pub fn send_key_signature(&mut self) {
        self.line.sense_connect();

        self.line.critical_enter();
        self.line.drive_busy();
        self.line.delay_us(KEY_SIG_BUSY_US);
        self.line.release_idle();
        self.line.delay_us(KEY_SIG_IDLE_US);
        self.line.critical_exit();

        trace!("key signature sent");
    }

    /// Transmits one byte frame and the inter-byte gap.
    pub fn send_byte(&mut self, byte: u8) {
        // Shift register: bit 0 = start (Busy), bits 1-8 = reversed data,
        // bit 9 = parity.  A 1 is shifted out as Idle, a 0 as Busy.
        let mut frame = u16::from(bit_reverse(byte)) << 1;
        frame |= u16::from(parity_bit(byte)) << 9;

        self.line.critical_enter();
        for _ in 0..10 {
            if frame & 1 == 1 {
                self.line.release_idle();
            } else {
                self.line.drive_busy();
            }
            self.line.delay_us(self.tx_bit_period_us);
            frame >>= 1;
        }

        match self.stop_bits {
            StopBitPolarity::BusyThenIdle => {
                self.line.drive_busy();
                self.line.delay_us(self.tx_bit_period_us * STOP_BITS);
                self.line.release_idle();
            }
            StopBitPolarity::IdleOnly => {
                self.line.release_idle();
                self.line.delay_us(self.tx_bit_period_us * STOP_BITS);
            }
        }
        self.line.critical_exit();

        // The radio needs Idle time to arm for the next start bit.
        self.line.delay_us(self.tx_bit_period_us * INTER_BYTE_GAP_BITS);

        trace!(byte = format_args!("0x{byte:02X}"), "tx");
    }

    /// Transmits a frame byte by byte, then releases the line and waits
    /// out the peer's processing latency.
    pub fn send_bytes(&mut self, data: &[u8]) {
        for &byte in data {
            self.send_byte(byte);
        }
        self.line.release_idle();
        self.line.delay_us(FRAME_SETTLE_US);
        trace!(len = data.len(), "frame sent");
    }

    /// Receives one byte, waiting up to `timeout_ms` for the start bit.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::Timeout`] when no start bit arrives in time.
    pub fn receive_byte(&mut self, timeout_ms: u32) -> Result<u8, KfdError> {
        self.line.release_idle();

        let deadline = self.line.now_us() + u64::from(timeout_ms) * 1000;

        // A line already Busy means the peer's start bit is in progress;
        // sample immediately, skipping the half-bit centring below.
        let already_busy = self.line.sample() == LineState::Busy;
        if !already_busy {
            loop {
                if self.line.sample() == LineState::Busy {
                    break;
                }
                if self.line.now_us() >= deadline {
                    return Err(KfdError::Timeout("start bit"));
                }
            }
        }

        self.line.critical_enter();
        if !already_busy {
            // Fresh edge: move to the centre of the start bit so every
            // later sample lands mid-bit.
            self.line.delay_us(self.rx_bit_period_us / 2);
        }

        // Ten samples: start, eight data bits, parity.  Idle shifts in a 1.
        let mut reg: u16 = 0;
        for bit in 0..10 {
            reg >>= 1;
            if self.line.sample() == LineState::Idle {
                reg |= 0x200;
            }
            if bit < 9 {
                self.line.delay_us(self.rx_bit_period_us);
            }
        }
        self.line.critical_exit();

        // Drain the stop bits: wait for the line to release, bounded.
        let drain_deadline = self.line.now_us() + STOP_DRAIN_CEILING_US;
        while self.line.sample() == LineState::Busy {
            if self.line.now_us() >= drain_deadline {
                break;
            }
            self.line.delay_us(10);
        }

        // Drop the start bit; the parity bit in bit 9 is not validated.
        // The frame CRC is authoritative.
        let raw = ((reg >> 1) & 0xFF) as u8;
        let byte = bit_reverse(raw);
        trace!(byte = format_args!("0x{byte:02X}"), "rx");
        Ok(byte)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
