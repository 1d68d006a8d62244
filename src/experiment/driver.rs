//! Experiment drivers: sample-environment hardware following a profile.
//!
//! A driver (load frame, furnace, cryostream...) is commanded through a small
//! lifecycle and exposes named sensor signals which plans monitor as SEVs.
//!
//! # State Machine
//!
//! ```text
//!            start()            pause()
//!  ┌──────┐ ───────▶ ┌─────────┐ ──────▶ ┌────────┐
//!  │ Idle │          │ Running │         │ Paused │
//!  └──────┘ ◀─────── └─────────┘ ◀────── └────────┘
//!     ▲      abort()             resume()     │
//!     └───────────────────────────────────────┘
//!                        abort()
//! ```
//!
//! `zero()` is only accepted while idle. Hardware specifics live behind
//! [`DriverControl`]; [`ExperimentDriver`] enforces the lifecycle and manages
//! abort conditions around it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::signal::{SevSignal, SignalSource};
use crate::error::{PlanError, PlanResult};

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverState {
    /// Not moving; can be zeroed or started.
    Idle,
    /// Following its profile.
    Running,
    /// Holding its current position.
    Paused,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Idle => write!(f, "IDLE"),
            DriverState::Running => write!(f, "RUNNING"),
            DriverState::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Linear ramp from `start` to `stop` over `duration` minutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriverProfileSection {
    /// Value at the start of the section
    pub start: f64,
    /// Value at the end of the section
    pub stop: f64,
    /// Section length in minutes
    pub duration: f64,
}

impl DriverProfileSection {
    /// Create a profile section.
    pub fn new(start: f64, stop: f64, duration: f64) -> Self {
        Self { start, stop, duration }
    }
}

/// Safety condition armed while the driver runs (e.g. a load limit).
pub trait AbortCondition: Send + Sync {
    /// Start watching.
    fn activate(&self);

    /// Stop watching.
    fn deactivate(&self);
}

/// What a driver should do: its profile and the conditions guarding it.
#[derive(Clone, Default)]
pub struct ExperimentDriverModel {
    /// Model name
    pub name: String,
    /// Sections followed in order
    pub profile: Vec<DriverProfileSection>,
    /// Armed on start, disarmed on abort
    pub abort_conditions: Vec<Arc<dyn AbortCondition>>,
}

impl ExperimentDriverModel {
    /// Model with a profile and no abort conditions.
    pub fn new(name: impl Into<String>, profile: Vec<DriverProfileSection>) -> Self {
        Self {
            name: name.into(),
            profile,
            abort_conditions: Vec::new(),
        }
    }

    /// Total profile length in minutes.
    pub fn total_duration(&self) -> f64 {
        self.profile.iter().map(|s| s.duration.max(0.0)).sum()
    }
}

impl fmt::Debug for ExperimentDriverModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentDriverModel")
            .field("name", &self.name)
            .field("profile", &self.profile)
            .field("abort_conditions", &self.abort_conditions.len())
            .finish()
    }
}

/// Hardware hooks invoked by [`ExperimentDriver`] after its state checks.
pub trait DriverControl: Send + Sync {
    /// Zero the driver's readback.
    fn zero(&self) -> PlanResult<()>;

    /// Begin following `model`'s profile.
    fn start(&self, model: &ExperimentDriverModel) -> PlanResult<()>;

    /// Hold position.
    fn pause(&self) -> PlanResult<()>;

    /// Continue from the held position.
    fn resume(&self) -> PlanResult<()>;

    /// Stop and return to idle.
    fn abort(&self) -> PlanResult<()>;
}

/// A driver with an enforced lifecycle and named sensors.
pub struct ExperimentDriver<C> {
    name: String,
    model: ExperimentDriverModel,
    sensors: HashMap<String, SevSignal>,
    control: C,
    state: Mutex<DriverState>,
}

impl<C: DriverControl> ExperimentDriver<C> {
    /// Idle driver commanding `control` with `model`.
    pub fn new(name: impl Into<String>, model: ExperimentDriverModel, control: C) -> Self {
        Self {
            name: name.into(),
            model,
            sensors: HashMap::new(),
            control,
            state: Mutex::new(DriverState::Idle),
        }
    }

    /// Expose `signal` as sensor `name`.
    pub fn with_sensor(mut self, name: impl Into<String>, signal: SevSignal) -> Self {
        self.sensors.insert(name.into(), signal);
        self
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current model.
    pub fn model(&self) -> &ExperimentDriverModel {
        &self.model
    }

    /// Replace the model. Only allowed while idle.
    pub fn set_model(&mut self, model: ExperimentDriverModel) -> PlanResult<()> {
        Self::check_valid_state(*self.state.get_mut(), "set_model", &[DriverState::Idle])?;
        self.model = model;
        Ok(())
    }

    /// All sensors by name.
    pub fn sensors(&self) -> &HashMap<String, SevSignal> {
        &self.sensors
    }

    /// Sensor called `name`.
    pub fn sensor(&self, name: &str) -> Option<SevSignal> {
        self.sensors.get(name).cloned()
    }

    /// Hardware hooks.
    pub fn control(&self) -> &C {
        &self.control
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// Zero the driver. Only allowed while idle.
    pub fn zero(&self) -> PlanResult<()> {
        let state = self.state.lock();
        Self::check_valid_state(*state, "zero", &[DriverState::Idle])?;
        self.control.zero()
    }

    /// Arm abort conditions and start following the profile.
    pub fn start(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        Self::check_valid_state(*state, "start", &[DriverState::Idle])?;

        for condition in &self.model.abort_conditions {
            condition.activate();
        }
        self.control.start(&self.model)?;
        *state = DriverState::Running;
        info!(driver = %self.name, model = %self.model.name, "Driver started");
        Ok(())
    }

    /// Hold position.
    pub fn pause(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        Self::check_valid_state(*state, "pause", &[DriverState::Running])?;
        self.control.pause()?;
        *state = DriverState::Paused;
        debug!(driver = %self.name, "Driver paused");
        Ok(())
    }

    /// Continue following the profile.
    pub fn resume(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        Self::check_valid_state(*state, "resume", &[DriverState::Paused])?;
        self.control.resume()?;
        *state = DriverState::Running;
        debug!(driver = %self.name, "Driver resumed");
        Ok(())
    }

    /// Disarm abort conditions and return to idle.
    pub fn abort(&self) -> PlanResult<()> {
        let mut state = self.state.lock();
        Self::check_valid_state(*state, "abort", &[DriverState::Running, DriverState::Paused])?;

        for condition in &self.model.abort_conditions {
            condition.deactivate();
        }
        self.control.abort()?;
        *state = DriverState::Idle;
        info!(driver = %self.name, "Driver aborted");
        Ok(())
    }

    fn check_valid_state(current: DriverState, method: &'static str, allowed: &[DriverState]) -> PlanResult<()> {
        if allowed.contains(&current) {
            return Ok(());
        }
        let allowed = allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        Err(PlanError::InvalidDriverState { method, allowed })
    }
}

impl<C> fmt::Debug for ExperimentDriver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sensors: Vec<&String> = self.sensors.keys().collect();
        sensors.sort();
        f.debug_struct("ExperimentDriver")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("sensors", &sensors)
            .field("state", &*self.state.lock())
            .finish()
    }
}

// =============================================================================
// Profile simulation
// =============================================================================

#[derive(Debug, Default)]
struct ProfileClock {
    profile: Vec<DriverProfileSection>,
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl ProfileClock {
    fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map(|since| since.elapsed()).unwrap_or_default()
    }
}

/// Signal following a piecewise-linear profile against driver time.
///
/// Time only advances while the signal is running; `minute` sets how long a
/// profile minute lasts in wall-clock time so simulations can run fast.
/// Clones share the same clock.
#[derive(Debug, Clone)]
pub struct ProfileSignal {
    minute: Duration,
    clock: Arc<Mutex<ProfileClock>>,
}

impl ProfileSignal {
    /// Signal over `profile` with real-time minutes.
    pub fn new(profile: Vec<DriverProfileSection>) -> Self {
        Self::with_minute(profile, Duration::from_secs(60))
    }

    /// Signal over `profile` where one profile minute lasts `minute`.
    pub fn with_minute(profile: Vec<DriverProfileSection>, minute: Duration) -> Self {
        Self {
            minute,
            clock: Arc::new(Mutex::new(ProfileClock {
                profile,
                ..ProfileClock::default()
            })),
        }
    }

    /// Value of `profile` after `elapsed_minutes`. Holds the last stop value
    /// past the end of the profile; an empty profile reads `0.0`.
    pub fn value_at(profile: &[DriverProfileSection], elapsed_minutes: f64) -> f64 {
        let mut remaining = elapsed_minutes.max(0.0);
        for section in profile {
            if section.duration > 0.0 && remaining < section.duration {
                return section.start + (section.stop - section.start) * remaining / section.duration;
            }
            remaining -= section.duration.max(0.0);
        }
        profile.last().map(|s| s.stop).unwrap_or(0.0)
    }

    /// Follow `profile` from its beginning on the next start.
    pub fn load(&self, profile: Vec<DriverProfileSection>) {
        let mut clock = self.clock.lock();
        clock.profile = profile;
        clock.accumulated = Duration::ZERO;
        clock.running_since = None;
    }

    /// Start (or continue) advancing through the profile.
    pub fn start(&self) {
        let mut clock = self.clock.lock();
        if clock.running_since.is_none() {
            clock.running_since = Some(Instant::now());
        }
    }

    /// Freeze at the current position.
    pub fn pause(&self) {
        let mut clock = self.clock.lock();
        if let Some(since) = clock.running_since.take() {
            clock.accumulated += since.elapsed();
        }
    }

    /// Freeze and rewind to the beginning of the profile.
    pub fn stop(&self) {
        let mut clock = self.clock.lock();
        clock.running_since = None;
        clock.accumulated = Duration::ZERO;
    }

    /// Profile minutes elapsed so far.
    pub fn elapsed_minutes(&self) -> f64 {
        self.clock.lock().elapsed().as_secs_f64() / self.minute.as_secs_f64()
    }
}

impl SignalSource for ProfileSignal {
    fn read(&self) -> f64 {
        let clock = self.clock.lock();
        let minutes = clock.elapsed().as_secs_f64() / self.minute.as_secs_f64();
        Self::value_at(&clock.profile, minutes)
    }
}

/// [`DriverControl`] moving a [`ProfileSignal`] instead of hardware.
#[derive(Debug, Clone)]
pub struct SimulatedControl {
    signal: ProfileSignal,
}

impl SimulatedControl {
    /// Control driving `signal`.
    pub fn new(signal: ProfileSignal) -> Self {
        Self { signal }
    }

    /// The driven signal.
    pub fn signal(&self) -> &ProfileSignal {
        &self.signal
    }
}

impl DriverControl for SimulatedControl {
    fn zero(&self) -> PlanResult<()> {
        self.signal.stop();
        Ok(())
    }

    fn start(&self, model: &ExperimentDriverModel) -> PlanResult<()> {
        self.signal.load(model.profile.clone());
        self.signal.start();
        Ok(())
    }

    fn pause(&self) -> PlanResult<()> {
        self.signal.pause();
        Ok(())
    }

    fn resume(&self) -> PlanResult<()> {
        self.signal.start();
        Ok(())
    }

    fn abort(&self) -> PlanResult<()> {
        self.signal.stop();
        Ok(())
    }
}

impl ExperimentDriver<SimulatedControl> {
    /// Simulated driver exposing its profile as sensor `"profile"`.
    pub fn simulated(name: impl Into<String>, model: ExperimentDriverModel, minute: Duration) -> Self {
        let signal = ProfileSignal::with_minute(model.profile.clone(), minute);
        Self::new(name, model, SimulatedControl::new(signal.clone())).with_sensor("profile", Arc::new(signal))
    }
}
