//! Error taxonomy for the KFD core.
//!
//! Every fallible operation in this crate returns [`KfdError`].  Errors
//! propagate synchronously to the dispatcher caller; nothing is recovered
//! internally except the bounded ready-response retry in the session
//! manager and the best-effort teardown that runs after any fatal error.

use thiserror::Error;

use crate::protocol::messages::OperationStatus;

/// Errors surfaced by the KFD core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KfdError {
    /// A configuration value is outside its permitted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second operation was started while one is already running.
    #[error("operation in progress")]
    OperationInProgress,

    /// No valid ready response was received after all handshake attempts.
    #[error("session failed: no ready response after {attempts} attempts")]
    SessionFailed { attempts: u32 },

    /// A bounded wait expired.  The payload names what was being waited on.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A received frame's leading byte is not a KMM opcode.  The trailing
    /// bytes captured after the opcode are attached for diagnostics.
    #[error("unexpected opcode 0x{opcode:02X} ({} trailing bytes captured)", .trailing.len())]
    UnexpectedOpcode { opcode: u8, trailing: Vec<u8> },

    /// A received frame's length field is out of range, or the peer stopped
    /// sending before the declared byte count arrived.
    #[error("malformed frame: {reason} (length {length})")]
    MalformedFrame { reason: &'static str, length: usize },

    /// The peer answered a command with a negative acknowledgment.
    #[error("negative acknowledgment from peer: {status}")]
    NegativeAck { status: OperationStatus },

    /// The peer answered with a KMM whose message id fits neither the
    /// expected response nor a negative acknowledgment.
    #[error("unexpected KMM message id 0x{message_id:02X} in response")]
    UnexpectedMessage { message_id: u8 },

    /// An abort request was observed between keys of a multi-key load.
    #[error("operation aborted")]
    Aborted,

    /// Key material length does not match the algorithm's expected length.
    #[error("invalid key length for algorithm 0x{algorithm_id:02X}: expected {expected}, got {actual}")]
    InvalidKeyLength {
        algorithm_id: u8,
        expected: usize,
        actual: usize,
    },

    /// A key field (keyset id, SLN, key id) is outside its valid range.
    #[error("invalid key field: {0}")]
    InvalidKeyField(&'static str),
}

/// Hardware fault detected by the line-driver self test.
///
/// Each fault carries the diagnostic code reported to the UI layer
/// (`0x01..=0x04`); `0x00` means all four checks passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelfTestFault {
    /// DATA reads Busy while released: the line is stuck low.
    #[error("DATA line stuck low")]
    DataStuckBusy,

    /// SENSE reads connected while released: the line is stuck low.
    #[error("SENSE line stuck low")]
    SenseStuckConnected,

    /// DATA reads Idle while driven Busy: the line is stuck high.
    #[error("DATA line stuck high")]
    DataStuckIdle,

    /// SENSE reads disconnected while driven: the line is stuck high.
    #[error("SENSE line stuck high")]
    SenseStuckDisconnected,
}

impl SelfTestFault {
    /// Diagnostic code for this fault as reported upward.
    pub fn code(self) -> u8 {
        match self {
            SelfTestFault::DataStuckBusy => 0x01,
            SelfTestFault::SenseStuckConnected => 0x02,
            SelfTestFault::DataStuckIdle => 0x03,
            SelfTestFault::SenseStuckDisconnected => 0x04,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_test_fault_codes_match_diagnostic_table() {
        assert_eq!(SelfTestFault::DataStuckBusy.code(), 0x01);
        assert_eq!(SelfTestFault::SenseStuckConnected.code(), 0x02);
        assert_eq!(SelfTestFault::DataStuckIdle.code(), 0x03);
        assert_eq!(SelfTestFault::SenseStuckDisconnected.code(), 0x04);
    }

    #[test]
    fn test_negative_ack_display_includes_status() {
        let err = KfdError::NegativeAck {
            status: OperationStatus::InvalidMac,
        };
        let text = err.to_string();
        assert!(text.contains("negative acknowledgment"), "got: {text}");
    }

    #[test]
    fn test_unexpected_opcode_display_reports_trailing_count() {
        let err = KfdError::UnexpectedOpcode {
            opcode: 0xC3,
            trailing: vec![0x01, 0x02, 0x03],
        };
        assert!(err.to_string().contains("0xC3"));
        assert!(err.to_string().contains("3 trailing"));
    }
}
