//! Line-driver abstraction for the DATA and SENSE wires.
//!
//! The Three-Wire Interface is DATA + SENSE + ground.  DATA is a single
//! bidirectional open-drain wire: Busy is actively driven low, Idle is the
//! released state that an external pull-up raises high.  SENSE is driven
//! low by the KFD to hold the radio in keyload mode.
//!
//! Implementations of [`LineDriver`] own the GPIO handles and the
//! microsecond clock for one physical (or simulated) interface.  The byte
//! codec and session layers are generic over this trait, so porting to new
//! hardware means implementing it and nothing else.  Interrupt masking is
//! part of the trait because one byte frame must not be pre-empted
//! mid-bit; hosted implementations leave the default no-ops in place.

use serde::{Deserialize, Serialize};

use crate::error::SelfTestFault;

/// Instantaneous state of the DATA wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Wire high: released under the external pull-up.
    Idle,
    /// Wire low: actively driven.
    Busy,
}

/// Polarity of the four stop bits that close each byte frame.
///
/// Reference fill devices drive the stop bits Busy and then release;
/// standard async serial keeps the line Idle instead.  The peer must be
/// configured compatibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBitPolarity {
    /// Drive Busy for the stop bits, then release to Idle.
    #[default]
    BusyThenIdle,
    /// Keep the line Idle for the stop bits.
    IdleOnly,
}

/// Ownership of one DATA + SENSE wire pair.
///
/// The driver is the sole owner of its GPIO lines; no other component may
/// touch them.  `delay_us` must busy-wait on a monotonic microsecond
/// clock (never sleep the CPU, never yield) because every intra-frame
/// interval in the codec is timed through it.
pub trait LineDriver {
    /// Drives DATA low (output, Busy).
    fn drive_busy(&mut self);

    /// Releases DATA (input with pull-up, Idle).
    fn release_idle(&mut self);

    /// Samples the DATA wire.
    fn sample(&mut self) -> LineState;

    /// Drives SENSE low (radio held in keyload mode).
    fn sense_connect(&mut self);

    /// Releases SENSE.
    fn sense_disconnect(&mut self);

    /// Reads the SENSE wire.
    fn sense_is_connected(&mut self) -> bool;

    /// Busy-waits at least `us` microseconds.
    fn delay_us(&mut self, us: u32);

    /// Monotonic microsecond clock used for bounded waits.
    fn now_us(&mut self) -> u64;

    /// Masks interrupts for the duration of one byte frame.  Hosted
    /// implementations have nothing to mask.
    fn critical_enter(&mut self) {}

    /// Unmasks interrupts after a byte frame.
    fn critical_exit(&mut self) {}

    /// Runs the four hardware checks on both wires.
    ///
    /// The driver state afterwards is DATA released and SENSE restored to
    /// whatever it was when the test started.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`SelfTestFault`].
    fn self_test(&mut self) -> Result<(), SelfTestFault> {
        let sense_was_connected = self.sense_is_connected();

        self.release_idle();
        self.sense_disconnect();
        self.delay_us(10_000);

        if self.sample() == LineState::Busy {
            return Err(SelfTestFault::DataStuckBusy);
        }
        if self.sense_is_connected() {
            return Err(SelfTestFault::SenseStuckConnected);
        }

        self.drive_busy();
        self.delay_us(10_000);
        let data_follows = self.sample() == LineState::Busy;
        self.release_idle();
        if !data_follows {
            return Err(SelfTestFault::DataStuckIdle);
        }

        self.sense_connect();
        self.delay_us(10_000);
        let sense_follows = self.sense_is_connected();
        if !sense_follows {
            self.sense_disconnect();
            return Err(SelfTestFault::SenseStuckDisconnected);
        }

        if sense_was_connected {
            self.sense_connect();
        } else {
            self.sense_disconnect();
        }
        Ok(())
    }
}
