//! Scripted radio peer for the virtual wire.
//!
//! [`VirtualRadio`] runs the *radio side* of the Three-Wire protocol on a
//! background thread: it watches for the key signature, answers the ready
//! request, receives KMM frames, and produces acknowledgments.  Integration
//! tests and the CLI demo use it as the far end of a [`VirtualWire`].
//!
//! The radio decodes bytes from the wire's edge capture rather than by
//! polling, the way real radio firmware latches the start-bit edge in an
//! interrupt handler.  A KFD is allowed to transmit the instant it has
//! drained a response's stop bits, which is sooner than any polling
//! receiver could re-arm; decoding from captured edges makes the radio
//! immune to that.
//!
//! This is protocol-level test tooling only.  It holds no key container
//! and stores nothing it receives beyond a log for assertions, which is
//! what separates it from a real KVL target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use crate::config::TwiConfig;
use crate::protocol::framer;
use crate::protocol::messages::{message_ids, opcodes, OperationStatus};
use crate::twi::codec::{bit_reverse, TwiCodec};
use crate::twi::line::{LineDriver, LineState};
use crate::twi::virt::{VirtualLineDriver, VirtualWire};

/// Busy runs at least this long count as a key signature.
const SIGNATURE_THRESHOLD_US: u64 = 50_000;

/// Bits in one byte frame: start + 8 data + parity + 4 stop.
const FRAME_BITS: u64 = 14;

/// Processing latency before the radio answers anything.
///
/// The KFD arms its receiver only after its inter-byte gap and frame
/// settle delays; answering faster than that would put the start bit on
/// the wire while nobody is listening.  Real radios take at least this
/// long to turn a frame around.
fn turnaround_us(config: &TwiConfig) -> u32 {
    4 * config.rx_bit_period_us() + 2000
}

/// How the radio answers each ready request, in order; the last entry
/// repeats for further attempts.
#[derive(Debug, Clone)]
pub enum ReadyReply {
    /// Answer `0xD0`: mobile radio.
    Mr,
    /// Answer `0xD1`: KVL.
    Kvl,
    /// Answer an arbitrary byte, e.g. line noise.
    Byte(u8),
    /// Do not answer.
    Silent,
}

/// How the radio answers each received KMM, in order; the last entry
/// repeats.
#[derive(Debug, Clone)]
pub enum KmmReply {
    /// Acknowledge according to the received command's message id.
    Auto,
    /// Answer a negative acknowledgment carrying `status`.
    Nak(OperationStatus),
    /// Answer a frame wrapping these exact inner bytes.
    RawInner(Vec<u8>),
    /// Answer these exact bytes with no framing at all, e.g. to emit a
    /// bogus opcode or a nonsense length field.
    RawBytes(Vec<u8>),
    /// Do not answer.
    Silent,
}

/// Scripted behaviour of a [`VirtualRadio`].
#[derive(Debug, Clone)]
pub struct RadioBehavior {
    pub ready: Vec<ReadyReply>,
    pub kmm: Vec<KmmReply>,
    /// Keyset ids reported by auto-answered inventory commands.
    pub keyset_ids: Vec<u8>,
}

impl Default for RadioBehavior {
    fn default() -> Self {
        Self {
            ready: vec![ReadyReply::Mr],
            kmm: vec![KmmReply::Auto],
            keyset_ids: vec![0x01],
        }
    }
}

/// Everything the radio observed, for test assertions.
#[derive(Debug, Clone, Default)]
pub struct RadioLog {
    /// Ready requests received (one per handshake attempt).
    pub ready_requests: usize,
    /// Raw frames as received, opcode and length bytes included.
    pub frames: Vec<Vec<u8>>,
    /// Inner KMMs extracted from those frames.
    pub kmms: Vec<Vec<u8>>,
    /// Transfer-done bytes received.
    pub transfer_done: usize,
    /// Disconnect bytes received.
    pub disconnects: usize,
}

/// A scripted radio running on a background thread.
pub struct VirtualRadio {
    stop: Arc<AtomicBool>,
    log: Arc<Mutex<RadioLog>>,
    thread: Option<JoinHandle<()>>,
}

impl VirtualRadio {
    /// Attaches a radio to `wire` and starts serving.
    ///
    /// `config` is the KFD's configuration; the radio swaps the transmit
    /// and receive speeds so the two ends agree even when they are
    /// asymmetric.
    pub fn spawn(wire: &VirtualWire, config: &TwiConfig, behavior: RadioBehavior) -> Self {
        let radio_config = TwiConfig {
            tx_kbaud: config.rx_kbaud,
            rx_kbaud: config.tx_kbaud,
            ..config.clone()
        };

        let stop = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(RadioLog::default()));

        let endpoint = wire.endpoint();
        let thread_stop = Arc::clone(&stop);
        let thread_log = Arc::clone(&log);
        let thread = std::thread::spawn(move || {
            serve(endpoint, &radio_config, behavior, &thread_stop, &thread_log);
        });

        Self {
            stop,
            log,
            thread: Some(thread),
        }
    }

    /// Snapshot of everything observed so far.
    pub fn log(&self) -> RadioLog {
        self.log.lock().unwrap().clone()
    }

    /// Stops the radio thread and returns the final log.
    pub fn shutdown(mut self) -> RadioLog {
        self.stop_thread();
        self.log.lock().unwrap().clone()
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for VirtualRadio {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

// ── Edge-capture receiver ─────────────────────────────────────────────────────

/// Byte receiver decoding from the wire's transition capture.
struct EdgeReceiver {
    /// Earliest timestamp at which the next start bit may begin.
    horizon_us: u64,
    /// Bit period of the transmitting side.
    bit_period_us: u64,
}

impl EdgeReceiver {
    /// Waits for a key signature: a Busy run of at least the threshold.
    /// Ordinary byte frames are skipped.  Returns the rising-edge
    /// timestamp ending the signature.
    fn wait_for_signature(
        &mut self,
        line: &mut VirtualLineDriver,
        stop: &AtomicBool,
    ) -> Option<u64> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            let Some(edge) = line.falling_edge_at_or_after(self.horizon_us) else {
                std::hint::spin_loop();
                continue;
            };
            let rise = loop {
                if stop.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(rise) = line.rising_edge_after(edge) {
                    break rise;
                }
                std::hint::spin_loop();
            };
            if rise - edge >= SIGNATURE_THRESHOLD_US {
                self.horizon_us = rise;
                return Some(rise);
            }
            // Not a signature; skip what must have been a byte frame.
            self.horizon_us = edge + FRAME_BITS * self.bit_period_us;
        }
    }

    /// Decodes the next byte frame, waiting up to `timeout_us` for its
    /// start edge.
    fn next_byte(
        &mut self,
        line: &mut VirtualLineDriver,
        timeout_us: u64,
        stop: &AtomicBool,
    ) -> Option<u8> {
        let deadline = line.now_us() + timeout_us;
        let edge = loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(edge) = line.falling_edge_at_or_after(self.horizon_us) {
                break edge;
            }
            if line.now_us() >= deadline {
                return None;
            }
            std::hint::spin_loop();
        };

        // Let the whole frame elapse, with half a bit of margin, before
        // reading it back from the capture.
        let frame_end = edge + FRAME_BITS * self.bit_period_us;
        while line.now_us() < frame_end + self.bit_period_us / 2 {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            std::hint::spin_loop();
        }

        // Sample start, data, and parity at bit centres.
        let mut reg: u16 = 0;
        for bit in 0..10u64 {
            reg >>= 1;
            let at = edge + bit * self.bit_period_us + self.bit_period_us / 2;
            if line.state_at(at) == LineState::Idle {
                reg |= 0x200;
            }
        }
        self.horizon_us = frame_end;

        Some(bit_reverse(((reg >> 1) & 0xFF) as u8))
    }

    /// Moves the receive horizon just past the radio's own last edge.
    /// Called after each radio transmission: the capture is shared, and
    /// the radio must not decode its own bytes as incoming.  The horizon
    /// stops at the last *own* edge rather than at "now" because a KFD is
    /// allowed to start its next frame inside the radio's trailing gap,
    /// and that frame must not be skipped.
    fn skip_own_transmission(&mut self, line: &VirtualLineDriver) {
        if let Some(edge) = line.last_driven_edge_us() {
            if edge + 1 > self.horizon_us {
                self.horizon_us = edge + 1;
            }
        }
    }
}

// ── Radio service loop ────────────────────────────────────────────────────────

fn serve(
    endpoint: VirtualLineDriver,
    config: &TwiConfig,
    behavior: RadioBehavior,
    stop: &AtomicBool,
    log: &Mutex<RadioLog>,
) {
    let mut codec = TwiCodec::new(endpoint, config);
    // The radio is a passive peer: it never drives SENSE.
    codec.line_mut().sense_disconnect();

    let turnaround = turnaround_us(config);
    let mut rx = EdgeReceiver {
        horizon_us: 0,
        bit_period_us: u64::from(config.rx_bit_period_us()),
    };
    let mut ready_attempt = 0usize;
    let mut kmm_count = 0usize;

    while !stop.load(Ordering::SeqCst) {
        if rx.wait_for_signature(codec.line_mut(), stop).is_none() {
            return;
        }
        debug!("radio: key signature seen");

        let Some(request) = rx.next_byte(codec.line_mut(), 500_000, stop) else {
            continue;
        };
        if request != opcodes::READY_REQ {
            debug!(byte = format_args!("0x{request:02X}"), "radio: not a ready request");
            continue;
        }
        log.lock().unwrap().ready_requests += 1;

        let reply = script_entry(&behavior.ready, ready_attempt).cloned();
        ready_attempt += 1;
        codec.delay_us(turnaround);
        match reply {
            Some(ReadyReply::Mr) => codec.send_byte(opcodes::READY_MR),
            Some(ReadyReply::Kvl) => codec.send_byte(opcodes::READY_KVL),
            Some(ReadyReply::Byte(byte)) => {
                codec.send_byte(byte);
                rx.skip_own_transmission(codec.line_mut());
                continue; // the KFD will retry from the signature
            }
            Some(ReadyReply::Silent) | None => continue,
        }
        rx.skip_own_transmission(codec.line_mut());

        serve_session(
            &mut codec,
            &mut rx,
            &behavior,
            turnaround,
            stop,
            log,
            &mut kmm_count,
        );
    }
}

fn serve_session(
    codec: &mut TwiCodec<VirtualLineDriver>,
    rx: &mut EdgeReceiver,
    behavior: &RadioBehavior,
    turnaround: u32,
    stop: &AtomicBool,
    log: &Mutex<RadioLog>,
    kmm_count: &mut usize,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(opcode) = rx.next_byte(codec.line_mut(), 2_000_000, stop) else {
            debug!("radio: session went quiet");
            return;
        };

        match opcode {
            opcodes::KMM => {
                let Some((raw, inner)) = read_frame(codec, rx, stop, opcode) else {
                    return;
                };
                {
                    let mut log = log.lock().unwrap();
                    log.frames.push(raw);
                    log.kmms.push(inner.clone());
                }

                let reply = script_entry(&behavior.kmm, *kmm_count).cloned();
                *kmm_count += 1;
                codec.delay_us(turnaround);
                match reply {
                    Some(KmmReply::Auto) => auto_reply(codec, behavior, &inner),
                    Some(KmmReply::Nak(status)) => send_nak(codec, status),
                    Some(KmmReply::RawInner(bytes)) => {
                        codec.send_bytes(&framer::wrap_kmm(&bytes));
                    }
                    Some(KmmReply::RawBytes(bytes)) => codec.send_bytes(&bytes),
                    Some(KmmReply::Silent) | None => {}
                }
                rx.skip_own_transmission(codec.line_mut());
            }
            opcodes::TRANSFER_DONE => {
                log.lock().unwrap().transfer_done += 1;
                codec.delay_us(turnaround);
                codec.send_byte(opcodes::TRANSFER_DONE);
                rx.skip_own_transmission(codec.line_mut());
            }
            opcodes::DISCONNECT => {
                log.lock().unwrap().disconnects += 1;
                codec.delay_us(turnaround);
                codec.send_byte(opcodes::DISCONNECT_ACK);
                rx.skip_own_transmission(codec.line_mut());
                return;
            }
            other => {
                debug!(byte = format_args!("0x{other:02X}"), "radio: ignoring byte");
            }
        }
    }
}

/// Reads length and payload of a KMM frame.  Returns the raw frame and the
/// inner KMM, or `None` on timeout or a nonsense length.
fn read_frame(
    codec: &mut TwiCodec<VirtualLineDriver>,
    rx: &mut EdgeReceiver,
    stop: &AtomicBool,
    opcode: u8,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let len_hi = rx.next_byte(codec.line_mut(), 1_000_000, stop)?;
    let len_lo = rx.next_byte(codec.line_mut(), 1_000_000, stop)?;
    let length = usize::from(u16::from_be_bytes([len_hi, len_lo]));
    if !(framer::MIN_FRAME_LENGTH..=framer::MAX_FRAME_LENGTH).contains(&length) {
        return None;
    }

    let mut payload = Vec::with_capacity(length);
    for _ in 0..length {
        payload.push(rx.next_byte(codec.line_mut(), 1_000_000, stop)?);
    }

    let mut raw = vec![opcode, len_hi, len_lo];
    raw.extend_from_slice(&payload);

    let inner = if payload.len() > framer::MIN_FRAME_LENGTH {
        payload[4..payload.len() - 2].to_vec()
    } else {
        payload
    };
    Some((raw, inner))
}

fn auto_reply(
    codec: &mut TwiCodec<VirtualLineDriver>,
    behavior: &RadioBehavior,
    inner: &[u8],
) {
    match inner.first() {
        Some(&message_ids::MODIFY_KEY_CMD) => {
            codec.send_bytes(&framer::build_frame(message_ids::REKEY_ACK, &[]));
        }
        Some(&message_ids::ZEROIZE_CMD) => {
            codec.send_bytes(&framer::build_frame(message_ids::ZEROIZE_RSP, &[]));
        }
        Some(&message_ids::INVENTORY_CMD) => {
            let inventory_type = inner.get(framer::INNER_HEADER_LEN).copied().unwrap_or(0);
            let mut body = vec![inventory_type];
            body.extend_from_slice(&(behavior.keyset_ids.len() as u16).to_be_bytes());
            body.extend_from_slice(&behavior.keyset_ids);
            codec.send_bytes(&framer::build_frame(message_ids::INVENTORY_RSP, &body));
        }
        _ => send_nak(codec, OperationStatus::InvalidMessageId),
    }
}

/// Emits a negative acknowledgment the way radios put it on this
/// transport: the status byte rides at offset 2 of the inner KMM.
fn send_nak(codec: &mut TwiCodec<VirtualLineDriver>, status: OperationStatus) {
    let inner = [
        message_ids::NEGATIVE_ACK,
        0x00,
        status.as_raw(),
        framer::RESPONSE_KIND_IMMEDIATE,
        0xFF, 0xFF, 0xFF,
        0xFF, 0xFF, 0xFF,
    ];
    codec.send_bytes(&framer::wrap_kmm(&inner));
}

fn script_entry<T>(script: &[T], index: usize) -> Option<&T> {
    script.get(index).or_else(|| script.last())
}
