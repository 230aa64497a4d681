//! Host-side virtual Three-Wire Interface.
//!
//! A [`VirtualWire`] models the electrical behaviour of the cable: the
//! DATA line is open-drain with a pull-up, so it reads Busy whenever *any*
//! endpoint drives it low and Idle only when every endpoint has released
//! it.  SENSE behaves the same way.  Each [`endpoint`](VirtualWire::endpoint)
//! is an independent [`LineDriver`], so a KFD and a simulated radio can
//! share one wire from two threads exactly as two devices share the
//! physical cable.
//!
//! Timing is real: `delay_us` busy-waits on a monotonic [`Instant`] clock,
//! which keeps the bit-banged waveforms honest at the cost of spinning a
//! core.  Tests that need determinism instead of realism use recorded
//! waveforms (see the codec tests); this module is for integration tests
//! and the CLI demo, which exercise the full stack end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::twi::line::{LineDriver, LineState};

struct WireShared {
    /// Number of endpoints currently pulling DATA low.
    data_pulls: AtomicUsize,
    /// Number of endpoints currently pulling SENSE low.
    sense_pulls: AtomicUsize,
    /// Every effective DATA transition as `(timestamp µs, now busy)`,
    /// ascending.  This is the wire's logic-analyzer capture: edge-driven
    /// receivers (the scripted radio, timing assertions in tests) decode
    /// from it instead of polling, the way real radio firmware latches
    /// edges in an interrupt handler.  Grows for the lifetime of the wire,
    /// which is bounded in practice by the length of a test run.
    transitions: Mutex<Vec<(u64, bool)>>,
    epoch: Instant,
}

/// A shared simulated cable.  Clone-free: hand out endpoints instead.
#[derive(Clone)]
pub struct VirtualWire {
    shared: Arc<WireShared>,
}

impl VirtualWire {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WireShared {
                data_pulls: AtomicUsize::new(0),
                sense_pulls: AtomicUsize::new(0),
                transitions: Mutex::new(Vec::new()),
                epoch: Instant::now(),
            }),
        }
    }

    /// Creates a new endpoint attached to this wire.
    pub fn endpoint(&self) -> VirtualLineDriver {
        VirtualLineDriver {
            shared: Arc::clone(&self.shared),
            driving_data: false,
            driving_sense: false,
            last_driven_edge_us: None,
        }
    }
}

impl Default for VirtualWire {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`VirtualWire`].
pub struct VirtualLineDriver {
    shared: Arc<WireShared>,
    driving_data: bool,
    driving_sense: bool,
    /// Timestamp of this endpoint's own most recent DATA edge.  Lets an
    /// edge-decoding receiver skip its own transmissions without skipping
    /// a peer frame already in flight.
    last_driven_edge_us: Option<u64>,
}

impl VirtualLineDriver {
    fn record_transition(&self, busy: bool) {
        let now = self.shared.epoch.elapsed().as_micros() as u64;
        self.shared.transitions.lock().unwrap().push((now, busy));
    }

    /// Timestamp of the first falling edge (Idle → Busy) at or after `t`,
    /// if one has been captured.
    pub fn falling_edge_at_or_after(&self, t: u64) -> Option<u64> {
        self.shared
            .transitions
            .lock()
            .unwrap()
            .iter()
            .find(|&&(at, busy)| busy && at >= t)
            .map(|&(at, _)| at)
    }

    /// Timestamp of the first rising edge (Busy → Idle) strictly after `t`.
    pub fn rising_edge_after(&self, t: u64) -> Option<u64> {
        self.shared
            .transitions
            .lock()
            .unwrap()
            .iter()
            .find(|&&(at, busy)| !busy && at > t)
            .map(|&(at, _)| at)
    }

    /// Timestamp of the most recent DATA edge this endpoint itself drove.
    pub fn last_driven_edge_us(&self) -> Option<u64> {
        self.last_driven_edge_us
    }

    /// Reconstructs the line state at a past instant from the capture.
    pub fn state_at(&self, t: u64) -> LineState {
        let transitions = self.shared.transitions.lock().unwrap();
        let mut state = LineState::Idle;
        for &(at, busy) in transitions.iter() {
            if at > t {
                break;
            }
            state = if busy { LineState::Busy } else { LineState::Idle };
        }
        state
    }
}

impl LineDriver for VirtualLineDriver {
    fn drive_busy(&mut self) {
        if !self.driving_data {
            self.driving_data = true;
            self.last_driven_edge_us = Some(self.shared.epoch.elapsed().as_micros() as u64);
            if self.shared.data_pulls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.record_transition(true);
            }
        }
    }

    fn release_idle(&mut self) {
        if self.driving_data {
            self.driving_data = false;
            self.last_driven_edge_us = Some(self.shared.epoch.elapsed().as_micros() as u64);
            if self.shared.data_pulls.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.record_transition(false);
            }
        }
    }

    fn sample(&mut self) -> LineState {
        if self.shared.data_pulls.load(Ordering::SeqCst) > 0 {
            LineState::Busy
        } else {
            LineState::Idle
        }
    }

    fn sense_connect(&mut self) {
        if !self.driving_sense {
            self.driving_sense = true;
            self.shared.sense_pulls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sense_disconnect(&mut self) {
        if self.driving_sense {
            self.driving_sense = false;
            self.shared.sense_pulls.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn sense_is_connected(&mut self) -> bool {
        self.shared.sense_pulls.load(Ordering::SeqCst) > 0
    }

    fn delay_us(&mut self, us: u32) {
        let start = self.shared.epoch.elapsed().as_micros() as u64;
        let target = start + u64::from(us);
        while (self.shared.epoch.elapsed().as_micros() as u64) < target {
            std::hint::spin_loop();
        }
    }

    fn now_us(&mut self) -> u64 {
        self.shared.epoch.elapsed().as_micros() as u64
    }
}

impl Drop for VirtualLineDriver {
    fn drop(&mut self) {
        self.release_idle();
        self.sense_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_released_wire_reads_idle() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        assert_eq!(a.sample(), LineState::Idle);
        assert!(!a.sense_is_connected());
    }

    #[test]
    fn test_any_driver_pulls_the_line_low() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        let mut b = wire.endpoint();

        a.drive_busy();
        assert_eq!(b.sample(), LineState::Busy);

        b.drive_busy();
        a.release_idle();
        // Still held low by b.
        assert_eq!(a.sample(), LineState::Busy);

        b.release_idle();
        assert_eq!(a.sample(), LineState::Idle);
    }

    #[test]
    fn test_redundant_drive_calls_do_not_stack() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        a.drive_busy();
        a.drive_busy();
        a.release_idle();
        assert_eq!(a.sample(), LineState::Idle);
    }

    #[test]
    fn test_dropping_an_endpoint_releases_its_lines() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        {
            let mut b = wire.endpoint();
            b.drive_busy();
            b.sense_connect();
            assert_eq!(a.sample(), LineState::Busy);
        }
        assert_eq!(a.sample(), LineState::Idle);
        assert!(!a.sense_is_connected());
    }

    #[test]
    fn test_delay_us_waits_at_least_the_requested_time() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        let before = a.now_us();
        a.delay_us(2_000);
        assert!(a.now_us() - before >= 2_000);
    }

    #[test]
    fn test_self_test_passes_on_a_healthy_wire() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        assert!(a.self_test().is_ok());
    }

    #[test]
    fn test_transition_capture_records_edges_once_per_wire_change() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        let mut b = wire.endpoint();

        a.drive_busy();
        b.drive_busy(); // wire already low: no new edge
        a.release_idle(); // still held by b: no edge
        a.delay_us(100);
        b.release_idle(); // wire rises

        let falling = a.falling_edge_at_or_after(0).expect("falling edge");
        let rising = a.rising_edge_after(falling).expect("rising edge");
        assert!(rising > falling);
        assert_eq!(a.rising_edge_after(rising), None);
    }

    #[test]
    fn test_state_reconstruction_from_capture() {
        let wire = VirtualWire::new();
        let mut a = wire.endpoint();
        let b = wire.endpoint();

        a.drive_busy();
        a.delay_us(500);
        a.release_idle();

        let falling = b.falling_edge_at_or_after(0).unwrap();
        let rising = b.rising_edge_after(falling).unwrap();
        assert_eq!(b.state_at(falling + (rising - falling) / 2), LineState::Busy);
        assert_eq!(b.state_at(rising + 10), LineState::Idle);
        assert!(rising - falling >= 500);
    }
}
