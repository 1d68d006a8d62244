//! Triggers driven by a sample environment variable.
//!
//! [`SevTrigger`] handles enable/disable bookkeeping and SEV registration; the
//! firing rule is a pluggable [`TriggerCondition`]. The two stock conditions
//! give the [`PositionTrigger`] and [`SingleFireTrigger`] variants.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::{Trigger, TriggerCore, Triggerable};
use crate::error::PlanResult;
use crate::experiment::registrar::PlanRegistrar;
use crate::experiment::sev::{ListenerId, SampleEnvironmentVariable, SignalListener};

/// Absolute slack when comparing signal deltas, so that decimal steps which
/// are not exactly representable (1.0 - 0.9 < 0.1) still reach an interval.
const SIGNAL_TOLERANCE: f64 = 1e-9;

/// Firing rule of an SEV trigger.
pub trait TriggerCondition: Send + fmt::Debug + 'static {
    /// Reset per-cycle state. `baseline` is the SEV value read on enable.
    fn arm(&mut self, baseline: f64);

    /// Decide whether `signal` fires the trigger, updating internal state.
    fn evaluate(&mut self, signal: f64) -> bool;
}

/// Fires whenever the signal has moved `interval` (in either direction) from
/// the value at the previous firing.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionCondition {
    interval: f64,
    last_trigger: f64,
}

impl PositionCondition {
    /// Condition firing every `interval` of signal change.
    pub fn new(interval: f64) -> Self {
        Self {
            interval: interval.abs(),
            last_trigger: 0.0,
        }
    }

    /// Signal change between firings.
    pub fn interval(&self) -> f64 {
        self.interval
    }
}

impl TriggerCondition for PositionCondition {
    fn arm(&mut self, baseline: f64) {
        self.last_trigger = baseline;
    }

    fn evaluate(&mut self, signal: f64) -> bool {
        let delta = (signal - self.last_trigger).abs();
        if delta >= self.interval - SIGNAL_TOLERANCE {
            self.last_trigger = signal;
            true
        } else {
            false
        }
    }
}

/// Fires once per enable cycle when the signal comes within `tolerance` of
/// `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleFireCondition {
    target: f64,
    tolerance: f64,
    fired: bool,
}

impl SingleFireCondition {
    /// Condition firing once near `target`.
    pub fn new(target: f64, tolerance: f64) -> Self {
        Self {
            target,
            tolerance: tolerance.abs(),
            fired: false,
        }
    }

    /// Whether the condition has fired in the current cycle.
    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

impl TriggerCondition for SingleFireCondition {
    fn arm(&mut self, _baseline: f64) {
        self.fired = false;
    }

    fn evaluate(&mut self, signal: f64) -> bool {
        if self.fired {
            return false;
        }
        self.fired = (signal - self.target).abs() <= self.tolerance;
        self.fired
    }
}

struct SevTriggerState<C> {
    condition: C,
    listener: Option<ListenerId>,
    triggering_signal: Option<f64>,
}

/// A trigger listening to an SEV, firing according to `C`.
pub struct SevTrigger<C> {
    core: TriggerCore,
    sev: Arc<SampleEnvironmentVariable>,
    state: Mutex<SevTriggerState<C>>,
    this: Weak<SevTrigger<C>>,
}

/// Fires every time the SEV moves by a fixed interval.
pub type PositionTrigger = SevTrigger<PositionCondition>;

/// Fires once when the SEV reaches a target value.
pub type SingleFireTrigger = SevTrigger<SingleFireCondition>;

impl<C: TriggerCondition> SevTrigger<C> {
    /// Create a disabled trigger with an arbitrary condition.
    pub fn with_condition(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        condition: C,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: TriggerCore::new(name.into(), registrar, triggerable),
            sev,
            state: Mutex::new(SevTriggerState {
                condition,
                listener: None,
                triggering_signal: None,
            }),
            this: this.clone(),
        })
    }

    /// The SEV this trigger listens to.
    pub fn sev(&self) -> &Arc<SampleEnvironmentVariable> {
        &self.sev
    }

    /// Signal value of the most recent firing.
    pub fn triggering_signal(&self) -> Option<f64> {
        self.state.lock().triggering_signal
    }

    /// Snapshot of the firing condition.
    pub fn condition(&self) -> C
    where
        C: Clone,
    {
        self.state.lock().condition.clone()
    }
}

impl SevTrigger<PositionCondition> {
    /// Position trigger firing every `trigger_interval` of SEV change.
    pub fn new(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_interval: f64,
    ) -> Arc<Self> {
        Self::with_condition(name, registrar, sev, triggerable, PositionCondition::new(trigger_interval))
    }
}

impl SevTrigger<SingleFireCondition> {
    /// Single-fire trigger aimed at `trigger_signal` ± `tolerance`.
    pub fn new(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_signal: f64,
        tolerance: f64,
    ) -> Arc<Self> {
        Self::with_condition(
            name,
            registrar,
            sev,
            triggerable,
            SingleFireCondition::new(trigger_signal, tolerance),
        )
    }
}

impl<C: TriggerCondition> Trigger for SevTrigger<C> {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn set_enabled(&self, enabled: bool) -> PlanResult<()> {
        let mut state = self.state.lock();
        if enabled == state.listener.is_some() {
            return Ok(());
        }

        if enabled {
            let Some(this) = self.this.upgrade() else {
                return Ok(());
            };
            let baseline = self.sev.read();
            state.condition.arm(baseline);
            state.listener = Some(self.sev.add_listener(this));
            debug!(trigger = %self.name(), sev = %self.sev.name(), baseline, "Trigger enabled");
        } else if let Some(id) = state.listener.take() {
            self.sev.remove_listener(id);
            debug!(trigger = %self.name(), "Trigger disabled");
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().listener.is_some()
    }
}

impl<C: TriggerCondition> SignalListener for SevTrigger<C> {
    fn signal_changed(&self, signal: f64) {
        {
            let mut state = self.state.lock();
            if state.listener.is_none() || !state.condition.evaluate(signal) {
                return;
            }
            state.triggering_signal = Some(signal);
        }
        self.core.fire(self, signal);
    }
}

impl<C: TriggerCondition> fmt::Debug for SevTrigger<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SevTrigger")
            .field("name", &self.core.name())
            .field("sev", &self.sev.name())
            .field("condition", &state.condition)
            .field("enabled", &state.listener.is_some())
            .finish()
    }
}
