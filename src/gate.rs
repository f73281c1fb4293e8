//! # Delivery Gate
//!
//! Per-consumer synchronization between receive calls, connection start/stop
//! and close.
//!
//! ## States
//!
//! ```text
//! NOT_STARTED <--start/stop--> STARTED
//!      |                          |
//!      +--------- release --------+--> CLOSED (terminal)
//! ```
//!
//! A receive holds the gate lock for its whole duration, which serializes
//! receive calls on one consumer. The part of a receive that touches the
//! reader runs inside a [`BusySection`]; `release` waits until no busy
//! section is open, so the reader can be destroyed right after it returns.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Gate phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    NotStarted,
    Started,
    Closed,
}

/// Returned once the gate has been released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateClosed;

#[derive(Debug)]
struct GateState {
    phase: GatePhase,
    busy: usize,
}

/// Start/busy/close coordination for one consumer
#[derive(Debug)]
pub struct DeliveryGate {
    serial: Mutex<()>,
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Exclusive hold on the gate, released on drop
pub struct GateLock<'a> {
    gate: &'a DeliveryGate,
    _serial: MutexGuard<'a, ()>,
}

/// Marks the reader as in use, released on drop
pub struct BusySection<'a> {
    gate: &'a DeliveryGate,
}

impl DeliveryGate {
    /// Create a gate, optionally already started
    pub fn new(started: bool) -> Self {
        Self {
            serial: Mutex::new(()),
            state: Mutex::new(GateState {
                phase: if started {
                    GatePhase::Started
                } else {
                    GatePhase::NotStarted
                },
                busy: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter the critical section; blocks while another caller holds it
    pub fn lock(&self) -> GateLock<'_> {
        GateLock {
            gate: self,
            _serial: self.serial.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Open the gate; no effect once closed
    pub fn start(&self) {
        let mut state = self.state();
        if state.phase == GatePhase::NotStarted {
            state.phase = GatePhase::Started;
            self.changed.notify_all();
        }
    }

    /// Hold delivery until the next `start`; no effect once closed
    pub fn stop(&self) {
        let mut state = self.state();
        if state.phase == GatePhase::Started {
            state.phase = GatePhase::NotStarted;
        }
    }

    /// Close the gate for good and wait for open busy sections to finish.
    /// Idempotent.
    pub fn release(&self) {
        let mut state = self.state();
        state.phase = GatePhase::Closed;
        self.changed.notify_all();
        while state.busy > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Current phase
    pub fn phase(&self) -> GatePhase {
        self.state().phase
    }

    /// Number of open busy sections
    pub fn busy_count(&self) -> usize {
        self.state().busy
    }

    /// Open a busy section only if the gate is started right now
    pub fn try_busy(&self) -> Option<BusySection<'_>> {
        let mut state = self.state();
        if state.phase != GatePhase::Started {
            return None;
        }
        state.busy += 1;
        Some(BusySection { gate: self })
    }

    fn notify_idle(&self) {
        let mut state = self.state();
        state.busy = state.busy.saturating_sub(1);
        if state.busy == 0 {
            self.changed.notify_all();
        }
    }
}

impl GateLock<'_> {
    /// Suspend until the gate is started
    pub fn await_start(&self) -> Result<(), GateClosed> {
        let mut state = self.gate.state();
        loop {
            match state.phase {
                GatePhase::Started => return Ok(()),
                GatePhase::Closed => return Err(GateClosed),
                GatePhase::NotStarted => {
                    state = self
                        .gate
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Like `await_start`, giving up at `deadline`.
    ///
    /// Returns `Ok(false)` when the deadline passes first.
    pub fn await_start_until(&self, deadline: Instant) -> Result<bool, GateClosed> {
        let mut state = self.gate.state();
        loop {
            match state.phase {
                GatePhase::Started => return Ok(true),
                GatePhase::Closed => return Err(GateClosed),
                GatePhase::NotStarted => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    state = self
                        .gate
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Mark the reader busy until the returned section is dropped
    ///
    /// Fails if the gate was released since `await_start`, so a release
    /// never misses a caller that is about to touch the reader.
    pub fn notify_busy(&self) -> Result<BusySection<'_>, GateClosed> {
        let mut state = self.gate.state();
        if state.phase == GatePhase::Closed {
            return Err(GateClosed);
        }
        state.busy += 1;
        Ok(BusySection { gate: self.gate })
    }
}

impl Drop for BusySection<'_> {
    fn drop(&mut self) {
        self.gate.notify_idle();
    }
}
