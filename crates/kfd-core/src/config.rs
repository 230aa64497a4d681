//! Device configuration for the Three-Wire Interface.
//!
//! All timing in the core derives from this structure.  Transfer speeds are
//! expressed in kilobaud; a bit period is `1000 / kbaud` microseconds, so
//! the default of 4 kbaud yields the standard 250 µs bit.  Transmit and
//! receive speeds are independently settable because some radios tolerate
//! asymmetric rates.

use serde::{Deserialize, Serialize};

use crate::error::KfdError;
use crate::twi::line::StopBitPolarity;

/// Default receive timeout applied to KMM responses, in milliseconds.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u32 = 5000;

/// Configuration for one KFD instance.
///
/// The pin numbers are carried for hardware [`LineDriver`] implementations
/// and for persistence; the host-side virtual wire ignores them.
///
/// [`LineDriver`]: crate::twi::line::LineDriver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwiConfig {
    /// GPIO identifier of the bidirectional open-drain DATA line.
    #[serde(default = "default_data_pin")]
    pub data_pin: u32,
    /// GPIO identifier of the SENSE line (driven low to hold the radio in
    /// keyload mode).
    #[serde(default = "default_sense_pin")]
    pub sense_pin: u32,
    /// Transmit speed in kilobaud, `1..=9`.
    #[serde(default = "default_kbaud")]
    pub tx_kbaud: u8,
    /// Receive speed in kilobaud, `1..=9`.
    #[serde(default = "default_kbaud")]
    pub rx_kbaud: u8,
    /// Polarity of the four stop bits appended to each byte frame.
    #[serde(default)]
    pub stop_bits: StopBitPolarity,
    /// Extra settling delay after the ready response, before the first KMM.
    #[serde(default)]
    pub post_ready_delay_us: u32,
    /// Timeout for each KMM response, in milliseconds.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u32,
}

fn default_data_pin() -> u32 {
    11
}
fn default_sense_pin() -> u32 {
    10
}
fn default_kbaud() -> u8 {
    4
}
fn default_receive_timeout_ms() -> u32 {
    DEFAULT_RECEIVE_TIMEOUT_MS
}

impl Default for TwiConfig {
    fn default() -> Self {
        Self {
            data_pin: default_data_pin(),
            sense_pin: default_sense_pin(),
            tx_kbaud: default_kbaud(),
            rx_kbaud: default_kbaud(),
            stop_bits: StopBitPolarity::default(),
            post_ready_delay_us: 0,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
        }
    }
}

impl TwiConfig {
    /// Checks every field against its permitted range.
    ///
    /// # Errors
    ///
    /// Returns [`KfdError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), KfdError> {
        if !(1..=9).contains(&self.tx_kbaud) {
            return Err(KfdError::InvalidConfig(format!(
                "tx_kbaud must be 1..=9, got {}",
                self.tx_kbaud
            )));
        }
        if !(1..=9).contains(&self.rx_kbaud) {
            return Err(KfdError::InvalidConfig(format!(
                "rx_kbaud must be 1..=9, got {}",
                self.rx_kbaud
            )));
        }
        if self.receive_timeout_ms == 0 {
            return Err(KfdError::InvalidConfig(
                "receive_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Transmit bit period in microseconds.
    pub fn tx_bit_period_us(&self) -> u32 {
        1000 / u32::from(self.tx_kbaud)
    }

    /// Receive bit period in microseconds.
    pub fn rx_bit_period_us(&self) -> u32 {
        1000 / u32::from(self.rx_kbaud)
    }
}
