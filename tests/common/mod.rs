//! Shared helpers for integration tests.

#![allow(dead_code)]

use daq_plan::experiment::{PlanRegistrar, Segment, TerminalPrinter, Trigger, Triggerable};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Counts trigger callbacks and waits for an expected number of them.
pub struct TriggerCounter {
    state: Mutex<(usize, usize)>,
    reached: Condvar,
}

impl TriggerCounter {
    pub fn new(target: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((target, 0)),
            reached: Condvar::new(),
        })
    }

    pub fn triggerable(self: &Arc<Self>) -> Triggerable {
        let counter = Arc::clone(self);
        Arc::new(move || counter.event_triggered())
    }

    pub fn event_triggered(&self) {
        let mut state = self.state.lock();
        state.1 += 1;
        if state.1 >= state.0 {
            self.reached.notify_all();
        }
    }

    /// Wait up to 50 ms per expected event. `true` if the target was reached.
    pub fn await_events(&self) -> bool {
        let mut state = self.state.lock();
        let deadline = Instant::now() + Duration::from_millis(50 * state.0.max(1) as u64);
        while state.1 < state.0 {
            if self.reached.wait_until(&mut state, deadline).timed_out() {
                return state.1 >= state.0;
            }
        }
        true
    }

    pub fn reset(&self, target: usize) {
        *self.state.lock() = (target, 0);
    }

    pub fn count(&self) -> usize {
        self.state.lock().1
    }
}

/// Registrar standing in for a plan; remembers what it was told.
#[derive(Default)]
pub struct RecordingRegistrar {
    pub triggers: Mutex<Vec<(String, f64)>>,
    pub segments: Mutex<Vec<(String, f64)>>,
}

impl RecordingRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger_signals(&self) -> Vec<f64> {
        self.triggers.lock().iter().map(|(_, signal)| *signal).collect()
    }
}

impl PlanRegistrar for RecordingRegistrar {
    fn trigger_occurred(&self, trigger: &dyn Trigger, triggering_signal: f64) {
        self.triggers.lock().push((trigger.name().to_string(), triggering_signal));
    }

    fn segment_complete(&self, segment: &dyn Segment, terminating_signal: f64) {
        self.segments.lock().push((segment.name().to_string(), terminating_signal));
    }
}

pub fn weak(registrar: &Arc<RecordingRegistrar>) -> Weak<dyn PlanRegistrar> {
    let weak: Weak<dyn PlanRegistrar> = Arc::downgrade(registrar) as Weak<dyn PlanRegistrar>;
    weak
}

/// Terminal keeping everything printed to it.
#[derive(Default)]
pub struct CapturingTerminal(pub Mutex<Vec<String>>);

impl TerminalPrinter for CapturingTerminal {
    fn print(&self, text: &str) {
        self.0.lock().push(text.to_string());
    }
}
