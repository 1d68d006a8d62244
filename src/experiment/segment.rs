//! Segments: phases of a plan bounded by a limit on a signal or by time.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────┐  activate()  ┌────────┐  limit reached  ┌──────────┐
//! │ Inactive │─────────────▶│ Active │────────────────▶│ Complete │
//! └──────────┘              └────────┘                 └──────────┘
//!                               ▲          activate()        │
//!                               └────────────────────────────┘
//! ```
//!
//! Activation enables the segment's triggers and starts monitoring. On
//! completion every trigger of the segment is disabled (including triggers
//! shared with other segments) and only then is the registrar told, so the
//! next segment starts from a clean slate.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error};

use super::registrar::PlanRegistrar;
use super::sev::{ListenerId, SampleEnvironmentVariable, SignalListener};
use super::timer::{Schedule, Timer};
use super::trigger::Trigger;
use crate::error::{PlanError, PlanResult};

// =============================================================================
// Limit conditions
// =============================================================================

/// Decides when an SEV segment ends, given the signal at activation and the
/// current signal.
pub trait LimitCondition: Send + Sync {
    /// `true` once the segment should terminate.
    fn limit_reached(&self, start_signal: f64, signal: f64) -> bool;
}

impl<F> LimitCondition for F
where
    F: Fn(f64, f64) -> bool + Send + Sync,
{
    fn limit_reached(&self, start_signal: f64, signal: f64) -> bool {
        self(start_signal, signal)
    }
}

/// Stock limit conditions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Limit {
    /// Signal at or above `value`.
    Above {
        /// Threshold
        value: f64,
    },
    /// Signal at or below `value`.
    Below {
        /// Threshold
        value: f64,
    },
    /// Signal moved at least `delta` away from its value at activation.
    ChangeOf {
        /// Absolute change
        delta: f64,
    },
}

impl LimitCondition for Limit {
    fn limit_reached(&self, start_signal: f64, signal: f64) -> bool {
        match *self {
            Limit::Above { value } => signal >= value,
            Limit::Below { value } => signal <= value,
            Limit::ChangeOf { delta } => (signal - start_signal).abs() >= delta.abs(),
        }
    }
}

// =============================================================================
// Segment trait
// =============================================================================

/// Lifecycle of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Defined but not yet activated.
    Inactive,
    /// Monitoring its signal, triggers enabled.
    Active,
    /// Limit reached, triggers disabled.
    Complete,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentState::Inactive => write!(f, "inactive"),
            SegmentState::Active => write!(f, "active"),
            SegmentState::Complete => write!(f, "complete"),
        }
    }
}

/// Capability shared by all segment variants.
pub trait Segment: Send + Sync + fmt::Debug {
    /// Name, unique within a plan.
    fn name(&self) -> &str;

    /// Enable triggers and start monitoring. Fails if already active.
    fn activate(&self) -> PlanResult<()>;

    /// Current lifecycle state.
    fn state(&self) -> SegmentState;

    /// Triggers enabled while this segment is active.
    fn triggers(&self) -> &[Arc<dyn Trigger>];

    /// Name of the monitored SEV, if the segment is signal-bounded.
    fn sample_environment_name(&self) -> Option<&str>;

    /// Whether the segment is currently active.
    fn is_activated(&self) -> bool {
        self.state() == SegmentState::Active
    }
}

struct SegmentCore {
    name: String,
    registrar: Weak<dyn PlanRegistrar>,
    triggers: Vec<Arc<dyn Trigger>>,
}

impl SegmentCore {
    fn enable_triggers(&self) -> PlanResult<()> {
        for (index, trigger) in self.triggers.iter().enumerate() {
            if let Err(err) = trigger.set_enabled(true) {
                for enabled in &self.triggers[..index] {
                    let _ = enabled.set_enabled(false);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn disable_triggers(&self) {
        for trigger in &self.triggers {
            if let Err(err) = trigger.set_enabled(false) {
                error!(segment = %self.name, trigger = %trigger.name(), error = %err, "Could not disable trigger");
            }
        }
    }

    fn complete(&self, segment: &dyn Segment, terminating_signal: f64) {
        debug!(segment = %self.name, terminating_signal, "Segment complete");
        self.disable_triggers();
        if let Some(registrar) = self.registrar.upgrade() {
            registrar.segment_complete(segment, terminating_signal);
        }
    }

    fn trigger_names(&self) -> Vec<&str> {
        self.triggers.iter().map(|t| t.name()).collect()
    }
}

// =============================================================================
// SevSegment
// =============================================================================

struct SevSegmentState {
    phase: SegmentState,
    start_signal: f64,
    listener: Option<ListenerId>,
}

/// Segment which ends when its [`LimitCondition`] holds for the SEV signal.
pub struct SevSegment {
    core: SegmentCore,
    sev: Arc<SampleEnvironmentVariable>,
    limit: Box<dyn LimitCondition>,
    state: Mutex<SevSegmentState>,
    this: Weak<SevSegment>,
}

impl SevSegment {
    /// Create an inactive SEV segment.
    pub fn new(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        sev: Arc<SampleEnvironmentVariable>,
        limit: Box<dyn LimitCondition>,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: SegmentCore {
                name: name.into(),
                registrar,
                triggers,
            },
            sev,
            limit,
            state: Mutex::new(SevSegmentState {
                phase: SegmentState::Inactive,
                start_signal: 0.0,
                listener: None,
            }),
            this: this.clone(),
        })
    }

    /// The monitored SEV.
    pub fn sev(&self) -> &Arc<SampleEnvironmentVariable> {
        &self.sev
    }

    /// SEV value read when the segment was last activated.
    pub fn start_signal(&self) -> f64 {
        self.state.lock().start_signal
    }
}

impl Segment for SevSegment {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn activate(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        if state.phase == SegmentState::Active {
            return Err(PlanError::SegmentAlreadyActive(self.core.name.clone()));
        }
        let Some(this) = self.this.upgrade() else {
            return Ok(());
        };

        self.core.enable_triggers()?;
        state.start_signal = self.sev.read();
        state.listener = Some(self.sev.add_listener(this));
        state.phase = SegmentState::Active;
        debug!(segment = %self.core.name, sev = %self.sev.name(), start_signal = state.start_signal, "Segment activated");
        Ok(())
    }

    fn state(&self) -> SegmentState {
        self.state.lock().phase
    }

    fn triggers(&self) -> &[Arc<dyn Trigger>] {
        &self.core.triggers
    }

    fn sample_environment_name(&self) -> Option<&str> {
        Some(self.sev.name())
    }
}

impl SignalListener for SevSegment {
    fn signal_changed(&self, signal: f64) {
        {
            let mut state = self.state.lock();
            if state.phase != SegmentState::Active || !self.limit.limit_reached(state.start_signal, signal) {
                return;
            }
            state.phase = SegmentState::Complete;
            if let Some(id) = state.listener.take() {
                self.sev.remove_listener(id);
            }
        }
        self.core.complete(self, signal);
    }
}

impl fmt::Debug for SevSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SevSegment")
            .field("name", &self.core.name)
            .field("sev", &self.sev.name())
            .field("triggers", &self.core.trigger_names())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// TimedSegment
// =============================================================================

struct TimedSegmentState {
    phase: SegmentState,
    timer: Option<Timer>,
}

/// Segment which ends after a fixed duration.
///
/// The terminating signal reported to the registrar is the elapsed time in
/// milliseconds.
pub struct TimedSegment {
    core: SegmentCore,
    duration: Duration,
    state: Mutex<TimedSegmentState>,
    this: Weak<TimedSegment>,
}

impl TimedSegment {
    /// Create an inactive timed segment.
    pub fn new(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        duration: Duration,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: SegmentCore {
                name: name.into(),
                registrar,
                triggers,
            },
            duration,
            state: Mutex::new(TimedSegmentState {
                phase: SegmentState::Inactive,
                timer: None,
            }),
            this: this.clone(),
        })
    }

    /// How long the segment lasts once activated.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn time_elapsed(&self, elapsed: Duration) {
        {
            let mut state = self.state.lock();
            if state.phase != SegmentState::Active {
                return;
            }
            state.phase = SegmentState::Complete;
            state.timer = None;
        }
        self.core.complete(self, elapsed.as_secs_f64() * 1000.0);
    }
}

impl Segment for TimedSegment {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn activate(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        if state.phase == SegmentState::Active {
            return Err(PlanError::SegmentAlreadyActive(self.core.name.clone()));
        }

        self.core.enable_triggers()?;
        let segment = self.this.clone();
        let timer = Timer::start(
            "experiment.plan.timed.segment",
            Schedule::Once(self.duration),
            move |elapsed| {
                if let Some(segment) = segment.upgrade() {
                    segment.time_elapsed(elapsed);
                }
            },
        );
        let timer = match timer {
            Ok(timer) => timer,
            Err(err) => {
                self.core.disable_triggers();
                return Err(err);
            }
        };

        state.timer = Some(timer);
        state.phase = SegmentState::Active;
        debug!(segment = %self.core.name, duration = ?self.duration, "Segment activated");
        Ok(())
    }

    fn state(&self) -> SegmentState {
        self.state.lock().phase
    }

    fn triggers(&self) -> &[Arc<dyn Trigger>] {
        &self.core.triggers
    }

    fn sample_environment_name(&self) -> Option<&str> {
        None
    }
}

impl fmt::Debug for TimedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedSegment")
            .field("name", &self.core.name)
            .field("duration", &self.duration)
            .field("triggers", &self.core.trigger_names())
            .field("state", &self.state())
            .finish()
    }
}
