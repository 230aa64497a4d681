//! KMM frame assembly and disassembly for the Three-Wire path.
//!
//! Wire format of a complete frame, transmitted top to bottom:
//!
//! ```text
//! [opcode 0xC2:1][length:2 BE][control 0x00:1][dest RSI:3]
//! [inner KMM: message-id:1, message-length:2 BE, message-format:1,
//!  dest RSI:3, source RSI:3, body:N]
//! [CRC:2, low byte first]
//! ```
//!
//! The outer length field counts every byte after itself, CRC included.
//! The inner message-length is `7 + body length`.  The CRC covers control,
//! destination RSI, and the inner KMM, excluding the opcode and length
//! field, and is appended low byte first, the opposite endianness of the
//! length field.
//!
//! Three-Wire frames are never preamble-wrapped; the 14-byte crypto
//! preamble belongs to Data-Link-Independent transports only.

use tracing::warn;

use crate::error::KfdError;
use crate::protocol::crc::crc16;
use crate::protocol::messages::{message_ids, KeyItem};

/// Control byte at the head of every outer frame payload.
pub const CONTROL: u8 = 0x00;

/// Broadcast Radio System Identity used for both RSI fields.
pub const BROADCAST_RSI: [u8; 3] = [0xFF, 0xFF, 0xFF];

/// Message-format byte requesting an immediate response (top two bits set).
pub const RESPONSE_KIND_IMMEDIATE: u8 = 0xC0;

/// Fixed bytes of an inner KMM before the body begins.
pub const INNER_HEADER_LEN: usize = 10;

/// Bounds accepted for the outer length field on receive.
pub const MIN_FRAME_LENGTH: usize = 6;
pub const MAX_FRAME_LENGTH: usize = 512;

// ── Builders ──────────────────────────────────────────────────────────────────

/// Builds the inner KMM: message id, length, format, RSIs, body.
pub fn inner_kmm(message_id: u8, body: &[u8]) -> Vec<u8> {
    let message_length = 7 + body.len();
    let mut kmm = Vec::with_capacity(INNER_HEADER_LEN + body.len());
    kmm.push(message_id);
    kmm.extend_from_slice(&(message_length as u16).to_be_bytes());
    kmm.push(RESPONSE_KIND_IMMEDIATE);
    kmm.extend_from_slice(&BROADCAST_RSI);
    kmm.extend_from_slice(&BROADCAST_RSI);
    kmm.extend_from_slice(body);
    kmm
}

/// Wraps an inner KMM in the outer Three-Wire envelope and appends the CRC.
pub fn wrap_kmm(inner: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + inner.len());
    payload.push(CONTROL);
    payload.extend_from_slice(&BROADCAST_RSI);
    payload.extend_from_slice(inner);

    let crc = crc16(&payload);

    let mut frame = Vec::with_capacity(3 + payload.len() + 2);
    frame.push(crate::protocol::messages::opcodes::KMM);
    frame.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.push(crc as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Builds a complete frame from a message id and body.
pub fn build_frame(message_id: u8, body: &[u8]) -> Vec<u8> {
    wrap_kmm(&inner_kmm(message_id, body))
}

/// Builds the ModifyKey command body.
///
/// All keys in one command share the keyset id, algorithm id, and key
/// length of the first entry; the caller is responsible for grouping keys
/// accordingly.  The per-key format byte carries the erase flag in bit 5.
pub fn modify_key_body(keys: &[KeyItem]) -> Vec<u8> {
    debug_assert!(!keys.is_empty());
    let first = &keys[0];

    let mut body = Vec::new();
    body.push(0x00); // decryption instruction format
    body.push(0x00); // extended decryption instruction format
    body.push(crate::protocol::messages::algorithm::CLEAR); // KEK algorithm id
    body.extend_from_slice(&[0x00, 0x00]); // KEK key id
    body.push(first.keyset_id as u8);
    body.push(first.algorithm_id);
    body.push(first.key.len() as u8);
    body.push(keys.len() as u8);

    for key in keys {
        body.push(if key.erase { 0x20 } else { 0x00 });
        body.extend_from_slice(&key.sln.to_be_bytes());
        body.extend_from_slice(&key.key_id.to_be_bytes());
        body.extend_from_slice(&key.key);
    }
    body
}

/// Builds a complete ModifyKey frame.
pub fn modify_key_frame(keys: &[KeyItem]) -> Vec<u8> {
    build_frame(message_ids::MODIFY_KEY_CMD, &modify_key_body(keys))
}

/// Builds a complete Zeroize frame.  The command carries no body; the
/// message id alone instructs the radio to erase every key it holds.
pub fn zeroize_frame() -> Vec<u8> {
    build_frame(message_ids::ZEROIZE_CMD, &[])
}

/// Builds a complete Inventory frame for the given inventory type.
pub fn inventory_frame(inventory_type: u8) -> Vec<u8> {
    build_frame(message_ids::INVENTORY_CMD, &[inventory_type])
}

// ── Parsers ───────────────────────────────────────────────────────────────────

/// Strips the outer envelope from a received frame payload.
///
/// `payload` is the byte run covered by the outer length field: control,
/// destination RSI, inner KMM, and trailing CRC.  Returns the inner KMM.
/// A CRC mismatch is logged but does not reject the frame; the radios this
/// core talks to occasionally pad teardown frames, and the message-id
/// check downstream is the authoritative accept/reject decision.
pub fn unwrap_frame(payload: &[u8]) -> Result<Vec<u8>, KfdError> {
    if payload.len() <= MIN_FRAME_LENGTH {
        // Degenerate frame: nothing to strip, surface it whole.
        return Ok(payload.to_vec());
    }

    let (covered, trailer) = payload.split_at(payload.len() - 2);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16(covered);
    if received != computed {
        warn!(
            received = format_args!("0x{received:04X}"),
            computed = format_args!("0x{computed:04X}"),
            "frame CRC mismatch"
        );
    }

    Ok(covered[4..].to_vec())
}

/// Operation status carried by a negative acknowledgment.
///
/// The status byte sits at offset 2 of the inner KMM as radios emit it on
/// this transport.  A truncated response maps to the invalid-message-number
/// status.
pub fn negative_ack_status(inner: &[u8]) -> crate::protocol::messages::OperationStatus {
    crate::protocol::messages::OperationStatus::from_raw(inner.get(2).copied().unwrap_or(0x0A))
}

/// Parsed inventory response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryReport {
    /// Inventory type echoed by the radio.
    pub inventory_type: u8,
    /// Item bytes; keyset ids for the list-active-keyset-ids type.
    pub keyset_ids: Vec<u8>,
}

/// Parses an inventory response inner KMM.
///
/// # Errors
///
/// Returns [`KfdError::MalformedFrame`] when the response is shorter than
/// the inventory header or truncates its declared item count.
pub fn parse_inventory_response(inner: &[u8]) -> Result<InventoryReport, KfdError> {
    if inner.len() < INNER_HEADER_LEN + 3 {
        return Err(KfdError::MalformedFrame {
            reason: "inventory response too short",
            length: inner.len(),
        });
    }

    let inventory_type = inner[INNER_HEADER_LEN];
    let count = usize::from(u16::from_be_bytes([
        inner[INNER_HEADER_LEN + 1],
        inner[INNER_HEADER_LEN + 2],
    ]));
    let items = &inner[INNER_HEADER_LEN + 3..];
    if items.len() < count {
        return Err(KfdError::MalformedFrame {
            reason: "inventory response truncates its item count",
            length: inner.len(),
        });
    }

    Ok(InventoryReport {
        inventory_type,
        keyset_ids: items[..count].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{algorithm, opcodes};

    fn aes_key_at_sln_202() -> KeyItem {
        KeyItem {
            keyset_id: 1,
            sln: 202,
            key_id: 202,
            algorithm_id: algorithm::AES_256,
            key: (0x11..=0x30).collect(),
            erase: false,
        }
    }

    #[test]
    fn test_modify_key_frame_exact_bytes_for_aes_key() {
        let frame = modify_key_frame(&[aes_key_at_sln_202()]);

        // Everything after opcode + length, up to the CRC.
        let mut expected_payload = vec![
            0x00, // control
            0xFF, 0xFF, 0xFF, // dest RSI
            0x04, // ModifyKey
            0x00, 0x35, // message length = 7 + 46
            0xC0, // immediate response
            0xFF, 0xFF, 0xFF, // inner dest RSI
            0xFF, 0xFF, 0xFF, // inner source RSI
            0x00, 0x00, // decryption instruction formats
            0x80, // KEK algorithm: clear
            0x00, 0x00, // KEK key id
            0x01, // keyset id
            0x84, // AES-256
            0x20, // key length 32
            0x01, // one key
            0x00, // key format: no erase
            0x00, 0xCA, // SLN 202
            0x00, 0xCA, // key id 202
        ];
        expected_payload.extend(0x11..=0x30u8);

        let crc = crc16(&expected_payload);
        let mut expected = vec![opcodes::KMM, 0x00, 0x3E];
        expected.extend_from_slice(&expected_payload);
        expected.push(crc as u8);
        expected.push((crc >> 8) as u8);

        assert_eq!(frame, expected);
    }

    #[test]
    fn test_frame_length_field_counts_everything_after_itself() {
        for frame in [
            modify_key_frame(&[aes_key_at_sln_202()]),
            zeroize_frame(),
            inventory_frame(crate::protocol::messages::inventory_types::LIST_ACTIVE_KSET_IDS),
        ] {
            let declared = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
            assert_eq!(declared, frame.len() - 3);
        }
    }

    #[test]
    fn test_frame_crc_covers_payload_and_is_little_endian() {
        let frame = modify_key_frame(&[aes_key_at_sln_202()]);
        let payload = &frame[3..frame.len() - 2];
        let crc = crc16(payload);
        assert_eq!(frame[frame.len() - 2], crc as u8);
        assert_eq!(frame[frame.len() - 1], (crc >> 8) as u8);
    }

    #[test]
    fn test_zeroize_frame_has_empty_body() {
        let frame = zeroize_frame();
        // opcode + length + control + dest RSI + 10-byte inner + CRC
        assert_eq!(frame.len(), 19);
        assert_eq!(frame[7], 0x0A); // message id
        assert_eq!(&frame[8..10], &[0x00, 0x07]); // message length = 7
    }

    #[test]
    fn test_inventory_frame_layout() {
        let frame =
            inventory_frame(crate::protocol::messages::inventory_types::LIST_ACTIVE_KSET_IDS);
        assert_eq!(frame.len(), 20);
        assert_eq!(frame[0], opcodes::KMM);
        assert_eq!(frame[7], 0x00); // inventory command
        assert_eq!(&frame[8..10], &[0x00, 0x08]); // message length = 7 + 1
        assert_eq!(frame[10], RESPONSE_KIND_IMMEDIATE);
        assert_eq!(frame[17], 0x02); // list-active-keyset-ids
    }

    #[test]
    fn test_erase_entry_sets_bit_five_of_key_format() {
        let key = KeyItem {
            erase: true,
            key: Vec::new(),
            ..aes_key_at_sln_202()
        };
        let body = modify_key_body(&[key]);
        assert_eq!(body[9], 0x20);
        assert_eq!(body[7], 0x00); // key length zero
    }

    #[test]
    fn test_multi_key_body_shares_header_fields() {
        let a = KeyItem {
            sln: 1,
            key_id: 10,
            key: vec![0xAA; 32],
            ..aes_key_at_sln_202()
        };
        let b = KeyItem {
            sln: 2,
            key_id: 11,
            key: vec![0xBB; 32],
            ..aes_key_at_sln_202()
        };
        let body = modify_key_body(&[a, b]);
        assert_eq!(body[8], 0x02); // key count
        assert_eq!(body.len(), 9 + 2 * (1 + 2 + 2 + 32));
    }

    #[test]
    fn test_unwrap_frame_round_trips_inner_kmm() {
        let inner = inner_kmm(message_ids::MODIFY_KEY_CMD, &[0x01, 0x02, 0x03]);
        let frame = wrap_kmm(&inner);
        let declared = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
        let recovered = unwrap_frame(&frame[3..3 + declared]).unwrap();
        assert_eq!(recovered, inner);
    }

    #[test]
    fn test_unwrap_frame_passes_degenerate_payload_through() {
        let short = [0x07, 0x00, 0x04, 0x80];
        assert_eq!(unwrap_frame(&short).unwrap(), short.to_vec());
    }

    #[test]
    fn test_negative_ack_status_reads_offset_two() {
        let inner = [0x08, 0x00, 0x06, 0xC0];
        assert_eq!(
            negative_ack_status(&inner),
            crate::protocol::messages::OperationStatus::InvalidMac
        );
    }

    #[test]
    fn test_negative_ack_status_defaults_on_truncated_response() {
        assert_eq!(
            negative_ack_status(&[0x08]),
            crate::protocol::messages::OperationStatus::InvalidMn
        );
    }

    #[test]
    fn test_parse_inventory_response_extracts_keyset_ids() {
        let mut body = vec![0x02, 0x00, 0x03]; // type, count = 3
        body.extend_from_slice(&[0x01, 0x02, 0x05]);
        let inner = inner_kmm(message_ids::INVENTORY_RSP, &body);
        let report = parse_inventory_response(&inner).unwrap();
        assert_eq!(report.inventory_type, 0x02);
        assert_eq!(report.keyset_ids, vec![0x01, 0x02, 0x05]);
    }

    #[test]
    fn test_parse_inventory_response_rejects_short_input() {
        let err = parse_inventory_response(&[0x01, 0x00]).unwrap_err();
        assert!(matches!(err, KfdError::MalformedFrame { .. }));
    }

    #[test]
    fn test_parse_inventory_response_rejects_missing_items() {
        let inner = inner_kmm(message_ids::INVENTORY_RSP, &[0x02, 0x00, 0x09, 0x01]);
        let err = parse_inventory_response(&inner).unwrap_err();
        assert!(matches!(err, KfdError::MalformedFrame { .. }));
    }
}
