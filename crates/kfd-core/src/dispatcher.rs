//! Operation dispatcher: the public manual-rekey API.
//!
//! A [`Kfd`] owns the byte codec (and through it the line driver) plus the
//! device configuration, and sequences framer, session, and codec for each
//! operation.  Control flow is strictly top-down (dispatcher, session,
//! framer, codec, line), and every operation is synchronous and
//! blocking: the core owns its execution context from session open to
//! close.
//!
//! At most one operation runs at a time.  The in-progress flag is shared
//! with [`KfdHandle`] so a UI thread can observe progress and request an
//! abort; the abort is honoured only between keys of a multi-key load,
//! never mid-exchange.

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TwiConfig;
use crate::error::{KfdError, SelfTestFault};
use crate::protocol::framer::{self, InventoryReport};
use crate::protocol::messages::{
    algorithm, inventory_types, message_ids, valid_keyset_id, KeyItem, PeerMode,
};
use crate::session::Session;
use crate::twi::codec::TwiCodec;
use crate::twi::line::LineDriver;

/// A Key Fill Device bound to one Three-Wire Interface.
pub struct Kfd<L: LineDriver> {
    codec: TwiCodec<L>,
    config: TwiConfig,
    busy: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

/// Cheap observer handle for UI threads: progress flag and abort request.
#[derive(Clone)]
pub struct KfdHandle {
    busy: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl KfdHandle {
    /// True while an operation is running.
    pub fn is_operation_in_progress(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Requests an abort.  Observed between keys inside a multi-key load;
    /// a single keyload runs to completion or timeout regardless.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// Clears the in-progress flag when an operation ends, on every path.
struct OpGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl<L: LineDriver> Kfd<L> {
    /// Creates a dispatcher over `line` with the given configuration.
    ///
    /// SENSE is asserted immediately and stays asserted across sessions,
    /// holding the radio in keyload mode.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] for out-of-range configuration.
    pub fn new(line: L, config: TwiConfig) -> Result<Self, KfdError> {
        config.validate()?;
        Ok(Self {
            codec: TwiCodec::new(line, &config),
            config,
            busy: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns an observer handle for another thread.
    pub fn handle(&self) -> KfdHandle {
        KfdHandle {
            busy: Arc::clone(&self.busy),
            abort: Arc::clone(&self.abort),
        }
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    /// Runs the line-driver hardware checks.
    ///
    /// # Errors
    ///
    /// Returns the first failing check.
    pub fn self_test(&mut self) -> Result<(), SelfTestFault> {
        self.codec.line_mut().self_test()
    }

    /// True when SENSE reads connected.
    pub fn is_peer_connected(&mut self) -> bool {
        self.codec.peer_connected()
    }

    /// True when the DATA wire reads Idle.
    pub fn is_line_idle(&mut self) -> bool {
        self.codec.line_is_idle()
    }

    /// True when the DATA wire reads Busy.
    pub fn is_line_busy(&mut self) -> bool {
        self.codec.line_is_busy()
    }

    /// Changes the transmit speed for subsequent operations.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] when `kbaud` is outside `1..=9`.
    pub fn set_tx_kbaud(&mut self, kbaud: u8) -> Result<(), KfdError> {
        self.codec.set_tx_kbaud(kbaud)?;
        self.config.tx_kbaud = kbaud;
        Ok(())
    }

    /// Changes the receive speed for subsequent operations.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] when `kbaud` is outside `1..=9`.
    pub fn set_rx_kbaud(&mut self, kbaud: u8) -> Result<(), KfdError> {
        self.codec.set_rx_kbaud(kbaud)?;
        self.config.rx_kbaud = kbaud;
        Ok(())
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Opens a session solely to learn the peer type, then tears down.
    ///
    /// # Errors
    ///
    /// Propagates session errors; see [`KfdError`].
    pub fn detect(&mut self) -> Result<PeerMode, KfdError> {
        let _guard = self.begin_operation()?;
        let session = Session::open(&mut self.codec, &self.config)?;
        let peer = session.peer();
        session.close();
        info!(%peer, "peer detected");
        Ok(peer)
    }

    /// Loads a single key.
    ///
    /// # Errors
    ///
    /// [`KfdError::NegativeAck`] carries the peer's status byte; other
    /// variants follow the crate taxonomy.
    pub fn keyload(&mut self, key: &KeyItem) -> Result<(), KfdError> {
        validate_key(key)?;
        let _guard = self.begin_operation()?;
        info!(
            keyset = key.keyset_id,
            sln = key.sln,
            key_id = key.key_id,
            algorithm = algorithm::name(key.algorithm_id),
            erase = key.erase,
            "keyload"
        );

        let mut session = Session::open(&mut self.codec, &self.config)?;
        session.send_kmm(&framer::modify_key_frame(slice::from_ref(key)));
        let response = session.receive_kmm(self.config.receive_timeout_ms);
        session.close();

        classify_modify_key_response(&response?)
    }

    /// Loads several keys in one session, reporting progress before each.
    ///
    /// Aborts on the first failure.  An abort request is honoured at the
    /// between-key check; the current key always completes.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::Aborted`] when an abort was requested, or the
    /// first per-key error.
    pub fn keyload_many(
        &mut self,
        keys: &[KeyItem],
        mut progress: impl FnMut(usize, usize, &str),
    ) -> Result<usize, KfdError> {
        if keys.is_empty() {
            return Ok(0);
        }
        for key in keys {
            validate_key(key)?;
        }

        let _guard = self.begin_operation()?;
        let total = keys.len();
        progress(0, total, "connecting to radio");

        let mut session = Session::open(&mut self.codec, &self.config)?;
        for (index, key) in keys.iter().enumerate() {
            if self.abort.load(Ordering::SeqCst) {
                session.close();
                return Err(KfdError::Aborted);
            }

            progress(index, total, &format!("loading key {} of {total}", index + 1));
            debug!(sln = key.sln, "loading key");

            session.send_kmm(&framer::modify_key_frame(slice::from_ref(key)));
            let response = match session.receive_kmm(self.config.receive_timeout_ms) {
                Ok(inner) => inner,
                Err(e) => {
                    session.close();
                    return Err(e);
                }
            };
            if let Err(e) = classify_modify_key_response(&response) {
                session.close();
                return Err(e);
            }
        }

        progress(total, total, "complete");
        session.close();
        info!(count = total, "all keys loaded");
        Ok(total)
    }

    /// Erases the key at one storage location.
    ///
    /// # Errors
    ///
    /// Same as [`Kfd::keyload`].
    pub fn erase_key(&mut self, keyset_id: u16, sln: u16) -> Result<(), KfdError> {
        let key = KeyItem {
            keyset_id,
            sln,
            erase: true,
            ..KeyItem::default()
        };
        self.keyload(&key)
    }

    /// Sends the Zeroize command, erasing every key the radio holds.
    ///
    /// # Errors
    ///
    /// Propagates session and response errors.
    pub fn erase_all(&mut self) -> Result<(), KfdError> {
        let _guard = self.begin_operation()?;
        info!("zeroize");

        let mut session = Session::open(&mut self.codec, &self.config)?;
        session.send_kmm(&framer::zeroize_frame());
        let response = session.receive_kmm(self.config.receive_timeout_ms);
        session.close();

        let inner = response?;
        match inner.first() {
            Some(&message_ids::ZEROIZE_RSP) => Ok(()),
            Some(&message_ids::NEGATIVE_ACK) => Err(KfdError::NegativeAck {
                status: framer::negative_ack_status(&inner),
            }),
            Some(&other) => Err(KfdError::UnexpectedMessage { message_id: other }),
            None => Err(empty_response()),
        }
    }

    /// Queries the radio for its active keyset ids.
    ///
    /// # Errors
    ///
    /// Propagates session and response errors.
    pub fn inventory(&mut self) -> Result<InventoryReport, KfdError> {
        let _guard = self.begin_operation()?;
        info!("inventory: list active keyset ids");

        let mut session = Session::open(&mut self.codec, &self.config)?;
        session.send_kmm(&framer::inventory_frame(
            inventory_types::LIST_ACTIVE_KSET_IDS,
        ));
        let response = session.receive_kmm(self.config.receive_timeout_ms);
        session.close();

        let inner = response?;
        match inner.first() {
            Some(&message_ids::INVENTORY_RSP) => framer::parse_inventory_response(&inner),
            Some(&message_ids::NEGATIVE_ACK) => Err(KfdError::NegativeAck {
                status: framer::negative_ack_status(&inner),
            }),
            Some(&other) => Err(KfdError::UnexpectedMessage { message_id: other }),
            None => Err(empty_response()),
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn begin_operation(&self) -> Result<OpGuard, KfdError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KfdError::OperationInProgress);
        }
        // A stale abort request from a previous operation must not cancel
        // this one.
        self.abort.store(false, Ordering::SeqCst);
        Ok(OpGuard {
            busy: Arc::clone(&self.busy),
        })
    }
}

fn classify_modify_key_response(inner: &[u8]) -> Result<(), KfdError> {
    match inner.first() {
        Some(&message_ids::REKEY_ACK) => Ok(()),
        Some(&message_ids::NEGATIVE_ACK) => Err(KfdError::NegativeAck {
            status: framer::negative_ack_status(inner),
        }),
        Some(&other) => Err(KfdError::UnexpectedMessage { message_id: other }),
        None => Err(empty_response()),
    }
}

fn empty_response() -> KfdError {
    KfdError::MalformedFrame {
        reason: "empty response",
        length: 0,
    }
}

fn validate_key(key: &KeyItem) -> Result<(), KfdError> {
    if !valid_keyset_id(key.keyset_id) {
        return Err(KfdError::InvalidKeyField("keyset id must be 1..=255"));
    }
    if key.erase {
        // Erase entries carry no key material; nothing further to check.
        return Ok(());
    }
    if let Some(expected) = algorithm::key_length(key.algorithm_id) {
        if key.key.len() != expected {
            return Err(KfdError::InvalidKeyLength {
                algorithm_id: key.algorithm_id,
                expected,
                actual: key.key.len(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twi::virt::VirtualWire;

    fn make_kfd() -> Kfd<crate::twi::virt::VirtualLineDriver> {
        let wire = VirtualWire::new();
        Kfd::new(wire.endpoint(), TwiConfig::default()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let wire = VirtualWire::new();
        let config = TwiConfig {
            tx_kbaud: 0,
            ..TwiConfig::default()
        };
        assert!(Kfd::new(wire.endpoint(), config).is_err());
    }

    #[test]
    fn test_second_operation_fails_while_first_is_in_flight() {
        let kfd = make_kfd();
        let guard = kfd.begin_operation().unwrap();
        assert_eq!(
            kfd.begin_operation().map(|_| ()),
            Err(KfdError::OperationInProgress)
        );
        drop(guard);
        assert!(kfd.begin_operation().is_ok());
    }

    #[test]
    fn test_handle_observes_in_progress_flag() {
        let kfd = make_kfd();
        let handle = kfd.handle();
        assert!(!handle.is_operation_in_progress());
        let guard = kfd.begin_operation().unwrap();
        assert!(handle.is_operation_in_progress());
        drop(guard);
        assert!(!handle.is_operation_in_progress());
    }

    #[test]
    fn test_begin_operation_clears_stale_abort_request() {
        let kfd = make_kfd();
        let handle = kfd.handle();
        handle.abort();
        let _guard = kfd.begin_operation().unwrap();
        assert!(!kfd.abort.load(Ordering::SeqCst));
    }

    #[test]
    fn test_validate_key_rejects_wrong_aes_length() {
        let key = KeyItem {
            key: vec![0u8; 16],
            ..KeyItem::default() // AES-256
        };
        assert_eq!(
            validate_key(&key),
            Err(KfdError::InvalidKeyLength {
                algorithm_id: algorithm::AES_256,
                expected: 32,
                actual: 16,
            })
        );
    }

    #[test]
    fn test_validate_key_accepts_unlisted_algorithm_without_check() {
        let key = KeyItem {
            algorithm_id: 0x42,
            key: vec![0u8; 7],
            ..KeyItem::default()
        };
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn test_validate_key_skips_length_check_for_erase() {
        let key = KeyItem {
            erase: true,
            key: Vec::new(),
            ..KeyItem::default() // AES-256 with empty material
        };
        assert!(validate_key(&key).is_ok());
    }

    #[test]
    fn test_validate_key_rejects_keyset_zero() {
        let key = KeyItem {
            keyset_id: 0,
            key: vec![0u8; 32],
            ..KeyItem::default()
        };
        assert_eq!(
            validate_key(&key),
            Err(KfdError::InvalidKeyField("keyset id must be 1..=255"))
        );
    }

    #[test]
    fn test_sense_asserted_from_construction() {
        let mut kfd = make_kfd();
        assert!(kfd.is_peer_connected());
        assert!(kfd.is_line_idle());
    }
}
