//! Keyload session handshake and framing I/O.
//!
//! State machine driven by this module:
//!
//! ```text
//! Idle ──key signature──► Signalling ──READY_REQ (0xC0)──► AwaitReady
//! AwaitReady ──0xD0──► Ready (peer = mobile radio)
//! AwaitReady ──0xD1──► Ready (peer = KVL)
//! AwaitReady ──timeout / other──► retry (up to 3 attempts, 500 ms apart)
//! Ready ──KMM exchange──► Exchanging ──TRANSFER_DONE──► Closing ──► Closed
//! ```
//!
//! The ready request must follow the key signature with no intervening
//! delay: the radio answers within hundreds of microseconds, and any
//! latency here corrupts the first response byte.  Teardown is
//! best-effort (a missing acknowledgment is logged and ignored) and
//! SENSE stays asserted afterwards so the radio remains in keyload mode
//! for the next operation.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::TwiConfig;
use crate::error::KfdError;
use crate::protocol::framer::{self, MAX_FRAME_LENGTH, MIN_FRAME_LENGTH};
use crate::protocol::messages::{opcodes, PeerMode};
use crate::twi::codec::TwiCodec;
use crate::twi::line::LineDriver;

/// Timeout for the ready response after each key signature.
const READY_TIMEOUT_MS: u32 = 2000;

/// Total handshake attempts before the session fails.
const SESSION_ATTEMPTS: u32 = 3;

/// Wait between handshake attempts.
const RETRY_DELAY_MS: u64 = 500;

/// Timeout for each teardown acknowledgment.
const TEARDOWN_TIMEOUT_MS: u32 = 1000;

/// Cap on trailing bytes captured after an unexpected opcode.
const UNEXPECTED_TRAIL_LIMIT: usize = 100;

/// Per-byte timeout while capturing that trail.
const UNEXPECTED_TRAIL_TIMEOUT_MS: u32 = 500;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Exchanging,
    Closed,
}

/// An open keyload session.
///
/// Created by [`Session::open`], which runs the handshake; dropped or
/// consumed by [`Session::close`], which runs the teardown.  The peer mode
/// is fixed the moment the ready response arrives and never changes within
/// a session.
pub struct Session<'a, L: LineDriver> {
    codec: &'a mut TwiCodec<L>,
    state: SessionState,
    peer: PeerMode,
}

impl<'a, L: LineDriver> Session<'a, L> {
    /// Runs the handshake: key signature, ready request, ready response.
    ///
    /// Retries the whole signature + request sequence on a bad or missing
    /// ready response, up to three attempts spaced 500 ms apart.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::SessionFailed`] when every attempt is exhausted.
    pub fn open(
        codec: &'a mut TwiCodec<L>,
        config: &TwiConfig,
    ) -> Result<Session<'a, L>, KfdError> {
        for attempt in 1..=SESSION_ATTEMPTS {
            if attempt > 1 {
                debug!(attempt, "retrying session handshake");
            }

            // Signature and ready request back to back; the peer responds
            // almost immediately after the signature's idle tail.
            codec.send_key_signature();
            codec.send_byte(opcodes::READY_REQ);

            match codec.receive_byte(READY_TIMEOUT_MS) {
                Ok(opcodes::READY_MR) => {
                    info!(attempt, "peer ready: mobile radio");
                    return Self::ready(codec, config, PeerMode::MobileRadio);
                }
                Ok(opcodes::READY_KVL) => {
                    info!(attempt, "peer ready: KVL");
                    return Self::ready(codec, config, PeerMode::Kvl);
                }
                Ok(other) => {
                    warn!(
                        attempt,
                        response = format_args!("0x{other:02X}"),
                        "unexpected ready response"
                    );
                }
                Err(KfdError::Timeout(_)) => {
                    debug!(attempt, "no ready response");
                }
                Err(e) => return Err(e),
            }

            if attempt < SESSION_ATTEMPTS {
                thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            }
        }

        Err(KfdError::SessionFailed {
            attempts: SESSION_ATTEMPTS,
        })
    }

    fn ready(
        codec: &'a mut TwiCodec<L>,
        config: &TwiConfig,
        peer: PeerMode,
    ) -> Result<Session<'a, L>, KfdError> {
        if config.post_ready_delay_us > 0 {
            codec.delay_us(config.post_ready_delay_us);
        }
        Ok(Session {
            codec,
            state: SessionState::Ready,
            peer,
        })
    }

    /// Peer type learned from the ready response.
    pub fn peer(&self) -> PeerMode {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transmits a prebuilt KMM frame.
    pub fn send_kmm(&mut self, frame: &[u8]) {
        self.state = SessionState::Exchanging;
        debug!(len = frame.len(), "sending KMM frame");
        self.codec.send_bytes(frame);
    }

    /// Receives one KMM frame and returns the inner KMM.
    ///
    /// # Errors
    ///
    /// - [`KfdError::Timeout`] when no opcode or length byte arrives.
    /// - [`KfdError::UnexpectedOpcode`] for any leading byte other than
    ///   `0xC2`; up to 100 trailing bytes are captured for diagnostics
    ///   rather than silently accepting the frame.
    /// - [`KfdError::MalformedFrame`] when the length field is outside
    ///   `6..=512` or the peer stops before the declared byte count.
    pub fn receive_kmm(&mut self, timeout_ms: u32) -> Result<Vec<u8>, KfdError> {
        let opcode = self
            .codec
            .receive_byte(timeout_ms)
            .map_err(|_| KfdError::Timeout("KMM opcode"))?;

        if opcode != opcodes::KMM {
            let mut trailing = Vec::new();
            while trailing.len() < UNEXPECTED_TRAIL_LIMIT {
                match self.codec.receive_byte(UNEXPECTED_TRAIL_TIMEOUT_MS) {
                    Ok(byte) => trailing.push(byte),
                    Err(_) => break,
                }
            }
            warn!(
                opcode = format_args!("0x{opcode:02X}"),
                trailing = trailing.len(),
                "unexpected opcode"
            );
            return Err(KfdError::UnexpectedOpcode { opcode, trailing });
        }

        let len_hi = self
            .codec
            .receive_byte(timeout_ms)
            .map_err(|_| KfdError::Timeout("frame length"))?;
        let len_lo = self
            .codec
            .receive_byte(timeout_ms)
            .map_err(|_| KfdError::Timeout("frame length"))?;
        let length = usize::from(u16::from_be_bytes([len_hi, len_lo]));

        if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&length) {
            warn!(length, "frame length out of range");
            return Err(KfdError::MalformedFrame {
                reason: "length field out of range",
                length,
            });
        }

        let mut payload = Vec::with_capacity(length);
        for _ in 0..length {
            match self.codec.receive_byte(timeout_ms) {
                Ok(byte) => payload.push(byte),
                Err(_) => {
                    return Err(KfdError::MalformedFrame {
                        reason: "frame truncated before declared length",
                        length: payload.len(),
                    });
                }
            }
        }

        let inner = framer::unwrap_frame(&payload)?;
        debug!(len = inner.len(), "received KMM frame");
        Ok(inner)
    }

    /// Runs the teardown exchange and consumes the session.
    ///
    /// Best-effort: missing acknowledgments are not retried.  SENSE is
    /// deliberately left asserted so the radio stays in keyload mode.
    pub fn close(mut self) {
        self.state = SessionState::Closed;
        self.codec.send_byte(opcodes::TRANSFER_DONE);

        match self.codec.receive_byte(TEARDOWN_TIMEOUT_MS) {
            Ok(opcodes::TRANSFER_DONE) => {
                self.codec.send_byte(opcodes::DISCONNECT);
                match self.codec.receive_byte(TEARDOWN_TIMEOUT_MS) {
                    Ok(opcodes::DISCONNECT_ACK) => debug!("disconnect acknowledged"),
                    Ok(other) => {
                        debug!(
                            response = format_args!("0x{other:02X}"),
                            "unexpected disconnect response"
                        );
                    }
                    Err(_) => debug!("no disconnect acknowledgment"),
                }
            }
            Ok(other) => {
                debug!(
                    response = format_args!("0x{other:02X}"),
                    "unexpected transfer-done response"
                );
            }
            Err(_) => debug!("no transfer-done acknowledgment"),
        }

        info!("session closed");
    }
}
