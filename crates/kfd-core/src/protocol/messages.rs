//! P25 Key Management Message vocabulary.
//!
//! Byte values from TIA-102.AACD-A: TWI session opcodes, KMM message ids,
//! inventory types, operation status codes, and the algorithm table.  The
//! session opcodes travel bare on the wire; everything else appears inside
//! a KMM frame.

use serde::{Deserialize, Serialize};

// ── TWI session opcodes ───────────────────────────────────────────────────────

/// Single-byte session opcodes exchanged outside KMM frames.
pub mod opcodes {
    /// KFD → peer: ready request, sent immediately after the key signature.
    pub const READY_REQ: u8 = 0xC0;
    /// Peer → KFD: ready, peer is a mobile radio.
    pub const READY_MR: u8 = 0xD0;
    /// Peer → KFD: ready, peer is a KVL (another fill device).
    pub const READY_KVL: u8 = 0xD1;
    /// Bidirectional: transfer done.
    pub const TRANSFER_DONE: u8 = 0xC1;
    /// A KMM frame follows this byte.
    pub const KMM: u8 = 0xC2;
    /// KFD → peer: disconnect.
    pub const DISCONNECT: u8 = 0x92;
    /// Peer → KFD: disconnect acknowledge.
    pub const DISCONNECT_ACK: u8 = 0x90;
}

// ── KMM message ids ───────────────────────────────────────────────────────────

/// Message id byte at the head of every inner KMM.
pub mod message_ids {
    pub const INVENTORY_CMD: u8 = 0x00;
    pub const INVENTORY_RSP: u8 = 0x01;
    pub const MODIFY_KEY_CMD: u8 = 0x04;
    pub const REKEY_ACK: u8 = 0x07;
    pub const NEGATIVE_ACK: u8 = 0x08;
    pub const ZEROIZE_CMD: u8 = 0x0A;
    pub const SESSION_CONTROL: u8 = 0x0B;
    pub const LOAD_CONFIG_CMD: u8 = 0x0C;
    pub const CHANGEOVER_CMD: u8 = 0x0D;
    pub const CHANGE_RSI_CMD: u8 = 0x0E;
    pub const ZEROIZE_RSP: u8 = 0x0F;
    pub const LOAD_CONFIG_RSP: u8 = 0x10;
    pub const CHANGEOVER_RSP: u8 = 0x11;
    pub const CHANGE_RSI_RSP: u8 = 0x12;
}

// ── Inventory types ───────────────────────────────────────────────────────────

/// Inventory-type byte carried in the body of an inventory command.
pub mod inventory_types {
    pub const NULL: u8 = 0x00;
    pub const SEND_CURRENT_DATETIME: u8 = 0x01;
    pub const LIST_ACTIVE_KSET_IDS: u8 = 0x02;
    pub const LIST_INACTIVE_KSET_IDS: u8 = 0x03;
    pub const LIST_ACTIVE_KEY_IDS: u8 = 0x04;
    pub const LIST_INACTIVE_KEY_IDS: u8 = 0x05;
    pub const LIST_KSET_TAGGING: u8 = 0xF9;
    pub const LIST_ACTIVE_KEYS: u8 = 0xFD;
    pub const LIST_MNP: u8 = 0xFE;
    pub const LIST_KMF_RSI: u8 = 0xFF;
}

// ── Operation status codes ────────────────────────────────────────────────────

/// Status byte carried by negative acknowledgments (Table 7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    CommandPerformed,
    KeyNotLoaded,
    KeyOverwritten,
    KeyStorageFull,
    KeyPreviouslyErased,
    InvalidMessageId,
    InvalidMac,
    InvalidCryptoHeader,
    InvalidKeyId,
    InvalidAlgorithmId,
    InvalidMn,
    InvalidKeyLength,
    InvalidKeysetId,
    UnsupportedFeature,
    KeysetNotFound,
    AlgorithmNotSupported,
    KeyNotFound,
    InternalError,
    /// A status byte outside the documented table, preserved verbatim.
    Other(u8),
}

impl OperationStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => OperationStatus::CommandPerformed,
            0x01 => OperationStatus::KeyNotLoaded,
            0x02 => OperationStatus::KeyOverwritten,
            0x03 => OperationStatus::KeyStorageFull,
            0x04 => OperationStatus::KeyPreviouslyErased,
            0x05 => OperationStatus::InvalidMessageId,
            0x06 => OperationStatus::InvalidMac,
            0x07 => OperationStatus::InvalidCryptoHeader,
            0x08 => OperationStatus::InvalidKeyId,
            0x09 => OperationStatus::InvalidAlgorithmId,
            0x0A => OperationStatus::InvalidMn,
            0x0B => OperationStatus::InvalidKeyLength,
            0x0C => OperationStatus::InvalidKeysetId,
            0x0D => OperationStatus::UnsupportedFeature,
            0x0E => OperationStatus::KeysetNotFound,
            0x0F => OperationStatus::AlgorithmNotSupported,
            0x10 => OperationStatus::KeyNotFound,
            0xFF => OperationStatus::InternalError,
            other => OperationStatus::Other(other),
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            OperationStatus::CommandPerformed => 0x00,
            OperationStatus::KeyNotLoaded => 0x01,
            OperationStatus::KeyOverwritten => 0x02,
            OperationStatus::KeyStorageFull => 0x03,
            OperationStatus::KeyPreviouslyErased => 0x04,
            OperationStatus::InvalidMessageId => 0x05,
            OperationStatus::InvalidMac => 0x06,
            OperationStatus::InvalidCryptoHeader => 0x07,
            OperationStatus::InvalidKeyId => 0x08,
            OperationStatus::InvalidAlgorithmId => 0x09,
            OperationStatus::InvalidMn => 0x0A,
            OperationStatus::InvalidKeyLength => 0x0B,
            OperationStatus::InvalidKeysetId => 0x0C,
            OperationStatus::UnsupportedFeature => 0x0D,
            OperationStatus::KeysetNotFound => 0x0E,
            OperationStatus::AlgorithmNotSupported => 0x0F,
            OperationStatus::KeyNotFound => 0x10,
            OperationStatus::InternalError => 0xFF,
            OperationStatus::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationStatus::CommandPerformed => "command performed",
            OperationStatus::KeyNotLoaded => "key not loaded",
            OperationStatus::KeyOverwritten => "key overwritten",
            OperationStatus::KeyStorageFull => "key storage full",
            OperationStatus::KeyPreviouslyErased => "key previously erased",
            OperationStatus::InvalidMessageId => "invalid message id",
            OperationStatus::InvalidMac => "invalid MAC",
            OperationStatus::InvalidCryptoHeader => "invalid crypto header",
            OperationStatus::InvalidKeyId => "invalid key id",
            OperationStatus::InvalidAlgorithmId => "invalid algorithm id",
            OperationStatus::InvalidMn => "invalid message number",
            OperationStatus::InvalidKeyLength => "invalid key length",
            OperationStatus::InvalidKeysetId => "invalid keyset id",
            OperationStatus::UnsupportedFeature => "unsupported feature",
            OperationStatus::KeysetNotFound => "keyset not found",
            OperationStatus::AlgorithmNotSupported => "algorithm not supported",
            OperationStatus::KeyNotFound => "key not found",
            OperationStatus::InternalError => "internal error",
            OperationStatus::Other(raw) => {
                return write!(f, "unknown status 0x{raw:02X}");
            }
        };
        write!(f, "{name} (0x{:02X})", self.as_raw())
    }
}

// ── Algorithm table ───────────────────────────────────────────────────────────

/// Algorithm identifiers and their expected key lengths (Table 7.1).
pub mod algorithm {
    pub const ACCORDION_1_3: u8 = 0x00;
    pub const BATON_AUTO: u8 = 0x01;
    pub const FIREFLY: u8 = 0x02;
    pub const MAYFLY: u8 = 0x03;
    pub const SAVILLE: u8 = 0x04;
    pub const PADSTONE: u8 = 0x05;
    pub const ACCORDION_4: u8 = 0x41;
    pub const BATON: u8 = 0x42;
    pub const CLEAR: u8 = 0x80;
    pub const DES_OFB: u8 = 0x81;
    pub const TDES_2KEY: u8 = 0x82;
    pub const TDES_3KEY: u8 = 0x83;
    pub const AES_256: u8 = 0x84;
    pub const AES_128: u8 = 0x85;
    pub const AES_CBC: u8 = 0x86;
    pub const ARC4: u8 = 0x9F;
    pub const ADP: u8 = 0xAA;

    /// Expected key-material length in bytes, or `None` for an id whose
    /// length is not fixed by the table (no validation is performed then).
    pub fn key_length(id: u8) -> Option<usize> {
        match id {
            DES_OFB => Some(8),
            TDES_2KEY => Some(16),
            TDES_3KEY => Some(24),
            AES_128 => Some(16),
            AES_256 => Some(32),
            AES_CBC => Some(32),
            ARC4 => Some(13),
            ADP => Some(5),
            CLEAR => Some(0),
            _ => None,
        }
    }

    /// Display name for UI and log output.
    pub fn name(id: u8) -> &'static str {
        match id {
            DES_OFB => "DES-OFB",
            TDES_2KEY => "2-KEY 3DES",
            TDES_3KEY => "3-KEY 3DES",
            AES_256 => "AES-256",
            AES_128 => "AES-128",
            AES_CBC => "AES-CBC",
            ARC4 => "ARC4",
            ADP => "ADP",
            CLEAR => "CLEAR",
            _ => "UNKNOWN",
        }
    }
}

// ── Key records ───────────────────────────────────────────────────────────────

/// First SLN of the KEK range.  SLNs below it address traffic keys.
pub const KEK_SLN_FLOOR: u16 = 0xF000;

/// A key record for load and erase operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyItem {
    /// Keyset the key belongs to, `1..=255`.
    pub keyset_id: u16,
    /// Storage Location Number (also called CKR).
    pub sln: u16,
    /// Key id advertised alongside the SLN.
    pub key_id: u16,
    /// Algorithm identifier from [`algorithm`].
    pub algorithm_id: u8,
    /// Raw key material; empty for erase operations.
    pub key: Vec<u8>,
    /// When set, the ModifyKey entry instructs the radio to erase the slot.
    pub erase: bool,
}

impl KeyItem {
    /// Whether the SLN addresses a key-encryption key.
    pub fn is_kek(&self) -> bool {
        self.sln >= KEK_SLN_FLOOR
    }
}

impl Default for KeyItem {
    fn default() -> Self {
        Self {
            keyset_id: 1,
            sln: 0,
            key_id: 0,
            algorithm_id: algorithm::AES_256,
            key: Vec::new(),
            erase: false,
        }
    }
}

/// Peer type learned from the ready response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// The peer is a mobile radio (`0xD0`).
    MobileRadio,
    /// The peer is another fill device (`0xD1`).
    Kvl,
}

impl std::fmt::Display for PeerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMode::MobileRadio => write!(f, "mobile radio"),
            PeerMode::Kvl => write!(f, "KVL"),
        }
    }
}

// ── Field validation ──────────────────────────────────────────────────────────

/// Returns `true` for a keyset id a radio will accept.
pub fn valid_keyset_id(id: u16) -> bool {
    (1..=255).contains(&id)
}

/// Returns `true` when `sln` falls in the range implied by `is_kek`.
pub fn valid_sln(sln: u16, is_kek: bool) -> bool {
    if is_kek {
        sln >= KEK_SLN_FLOOR
    } else {
        sln < KEK_SLN_FLOOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_key_lengths_match_table() {
        assert_eq!(algorithm::key_length(algorithm::DES_OFB), Some(8));
        assert_eq!(algorithm::key_length(algorithm::TDES_2KEY), Some(16));
        assert_eq!(algorithm::key_length(algorithm::TDES_3KEY), Some(24));
        assert_eq!(algorithm::key_length(algorithm::AES_256), Some(32));
        assert_eq!(algorithm::key_length(algorithm::AES_128), Some(16));
        assert_eq!(algorithm::key_length(algorithm::ARC4), Some(13));
        assert_eq!(algorithm::key_length(algorithm::ADP), Some(5));
        assert_eq!(algorithm::key_length(algorithm::CLEAR), Some(0));
    }

    #[test]
    fn test_unlisted_algorithm_has_no_expected_length() {
        assert_eq!(algorithm::key_length(0x42), None);
        assert_eq!(algorithm::key_length(0x77), None);
    }

    #[test]
    fn test_sln_range_splits_tek_and_kek() {
        let tek = KeyItem {
            sln: 0xEFFF,
            ..KeyItem::default()
        };
        let kek = KeyItem {
            sln: 0xF000,
            ..KeyItem::default()
        };
        assert!(!tek.is_kek());
        assert!(kek.is_kek());
    }

    #[test]
    fn test_operation_status_round_trips_through_raw() {
        for raw in 0x00..=0x10 {
            assert_eq!(OperationStatus::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(OperationStatus::from_raw(0xFF), OperationStatus::InternalError);
        assert_eq!(
            OperationStatus::from_raw(0x55),
            OperationStatus::Other(0x55)
        );
        assert_eq!(OperationStatus::Other(0x55).as_raw(), 0x55);
    }

    #[test]
    fn test_keyset_id_bounds() {
        assert!(!valid_keyset_id(0));
        assert!(valid_keyset_id(1));
        assert!(valid_keyset_id(255));
        assert!(!valid_keyset_id(256));
    }

    #[test]
    fn test_sln_validation_respects_key_type() {
        assert!(valid_sln(0, false));
        assert!(valid_sln(0xEFFF, false));
        assert!(!valid_sln(0xF000, false));
        assert!(valid_sln(0xF000, true));
        assert!(!valid_sln(0x1234, true));
    }
}
