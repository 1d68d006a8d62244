//! Declarative plan files.
//!
//! A plan file is a TOML document describing SEVs (backed by simulated
//! signals), triggers and the segment chain. [`PlanDefinition::build`] turns
//! it into a live [`Plan`]. Trigger callbacks log the firing; hardware
//! integrations build plans programmatically instead.
//!
//! ```toml
//! name = "tensile-demo"
//!
//! [[sev]]
//! name = "load"
//! poll_period_ms = 50
//! signal = { kind = "linear", start = 0.0, step = 0.5 }
//!
//! [[trigger]]
//! name = "xrd"
//! kind = "position"
//! sev = "load"
//! interval = 5.0
//!
//! [[segment]]
//! name = "ramp"
//! sev = "load"
//! limit = { kind = "above", value = 50.0 }
//! triggers = ["xrd"]
//!
//! [[segment]]
//! name = "hold"
//! duration_ms = 2000
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{PlanError, PlanResult};
use crate::experiment::signal::sims;
use crate::experiment::{
    DriverProfileSection, DriverState, ExperimentDriver, ExperimentDriverModel, Limit, Plan, PlanServices,
    SampleEnvironmentVariable, SevSignal, SimulatedControl, Trigger, Triggerable,
};

/// Top-level plan file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    /// Plan name; also names the experiment data directory
    pub name: String,
    /// Sample environment variables
    #[serde(default, rename = "sev")]
    pub sevs: Vec<SevDefinition>,
    /// Triggers, referenced by name from segments
    #[serde(default, rename = "trigger")]
    pub triggers: Vec<TriggerDefinition>,
    /// Segments in execution order
    #[serde(default, rename = "segment")]
    pub segments: Vec<SegmentDefinition>,
}

/// A sample environment variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SevDefinition {
    /// SEV name
    pub name: String,
    /// Polling period; the configured engine default when absent
    #[serde(default)]
    pub poll_period_ms: Option<u64>,
    /// Simulated signal source
    pub signal: SignalDefinition,
}

/// Simulated signal sources available to plan files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalDefinition {
    /// Always reads `value`
    Constant {
        /// Reading
        value: f64,
    },
    /// Advances by `step` on every read
    Linear {
        /// Value before the first read
        start: f64,
        /// Increment per read
        step: f64,
    },
    /// `offset + amplitude * sin(2π x / period)` for x = 1, 2, … per read
    Sine {
        /// Peak deviation from `offset`
        amplitude: f64,
        /// Reads per full cycle
        period: f64,
        /// Centre value
        #[serde(default)]
        offset: f64,
    },
    /// Piecewise-linear driver profile, run by a simulated driver while the
    /// plan executes
    Profile {
        /// Profile sections (durations in minutes)
        sections: Vec<DriverProfileSection>,
        /// Wall-clock length of one profile minute
        #[serde(default = "default_minute_ms")]
        minute_ms: u64,
    },
}

fn default_minute_ms() -> u64 {
    60_000
}

/// A trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Trigger name, unique within the plan
    pub name: String,
    /// Firing rule
    #[serde(flatten)]
    pub kind: TriggerKind,
}

/// Firing rules available to plan files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fire every `interval` of change in `sev`
    Position {
        /// SEV name
        sev: String,
        /// Signal change between firings
        interval: f64,
    },
    /// Fire once when `sev` comes within `tolerance` of `target`
    SingleFire {
        /// SEV name
        sev: String,
        /// Target signal
        target: f64,
        /// Accepted deviation
        tolerance: f64,
    },
    /// Fire every `period_ms`
    Timed {
        /// Period in milliseconds
        period_ms: u64,
    },
}

/// A segment, bounded by either `sev` + `limit` or `duration_ms`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDefinition {
    /// Segment name, unique within the plan
    pub name: String,
    /// Monitored SEV
    #[serde(default)]
    pub sev: Option<String>,
    /// Terminating condition on `sev`
    #[serde(default)]
    pub limit: Option<Limit>,
    /// Segment length for timed segments
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Names of triggers enabled while the segment is active
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl PlanDefinition {
    /// Read and parse a plan file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan file {:?}", path.as_ref()))?;
        Self::from_toml_str(&text).with_context(|| format!("Invalid plan file {:?}", path.as_ref()))
    }

    /// Parse a plan from TOML text.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("Failed to parse plan definition")
    }

    /// Check references between SEVs, triggers and segments.
    pub fn validate(&self) -> PlanResult<()> {
        let sevs: Vec<&str> = self.sevs.iter().map(|s| s.name.as_str()).collect();
        let known_sev = |name: &str| -> PlanResult<()> {
            if sevs.contains(&name) {
                Ok(())
            } else {
                Err(PlanError::Configuration(format!("Unknown SEV '{name}'")))
            }
        };

        for trigger in &self.triggers {
            match &trigger.kind {
                TriggerKind::Position { sev, interval } => {
                    known_sev(sev)?;
                    if *interval <= 0.0 {
                        return Err(PlanError::Configuration(format!(
                            "Trigger '{}' needs a positive interval",
                            trigger.name
                        )));
                    }
                }
                TriggerKind::SingleFire { sev, tolerance, .. } => {
                    known_sev(sev)?;
                    if *tolerance < 0.0 {
                        return Err(PlanError::Configuration(format!(
                            "Trigger '{}' has a negative tolerance",
                            trigger.name
                        )));
                    }
                }
                TriggerKind::Timed { period_ms } => {
                    if *period_ms == 0 {
                        return Err(PlanError::Configuration(format!(
                            "Trigger '{}' needs a positive period",
                            trigger.name
                        )));
                    }
                }
            }
        }

        for segment in &self.segments {
            match (&segment.sev, &segment.limit, segment.duration_ms) {
                (Some(sev), Some(_), None) => known_sev(sev)?,
                (None, None, Some(_)) => {}
                _ => {
                    return Err(PlanError::Configuration(format!(
                        "Segment '{}' needs either 'sev' and 'limit', or 'duration_ms'",
                        segment.name
                    )))
                }
            }
            for name in &segment.triggers {
                if !self.triggers.iter().any(|t| &t.name == name) {
                    return Err(PlanError::Configuration(format!(
                        "Segment '{}' references unknown trigger '{name}'",
                        segment.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build a live plan. SEVs without a polling period poll every
    /// `default_poll_period`.
    pub fn build(&self, services: PlanServices, default_poll_period: Duration) -> PlanResult<LoadedPlan> {
        self.validate()?;

        let plan = Plan::with_services(self.name.clone(), services);
        let mut drivers = Vec::new();
        let mut sevs: HashMap<&str, Arc<SampleEnvironmentVariable>> = HashMap::new();

        for definition in &self.sevs {
            let signal: SevSignal = match &definition.signal {
                SignalDefinition::Constant { value } => {
                    let value = *value;
                    Arc::new(move || value)
                }
                SignalDefinition::Linear { start, step } => Arc::new(sims::linear_evolution(*start, *step)),
                SignalDefinition::Sine {
                    amplitude,
                    period,
                    offset,
                } => {
                    let (amplitude, period, offset) = (*amplitude, *period, *offset);
                    Arc::new(sims::from_function(move |x| {
                        offset + amplitude * (std::f64::consts::TAU * x / period).sin()
                    }))
                }
                SignalDefinition::Profile { sections, minute_ms } => {
                    let model = ExperimentDriverModel::new(definition.name.clone(), sections.clone());
                    let driver = ExperimentDriver::simulated(
                        format!("{}-driver", definition.name),
                        model,
                        Duration::from_millis(*minute_ms),
                    );
                    let sensor = driver
                        .sensor("profile")
                        .ok_or_else(|| PlanError::Configuration("Simulated driver has no profile sensor".into()))?;
                    drivers.push(driver);
                    sensor
                }
            };
            let period = definition
                .poll_period_ms
                .map(Duration::from_millis)
                .unwrap_or(default_poll_period);
            let sev = plan.add_sev(&definition.name, signal, Some(period));
            sevs.insert(definition.name.as_str(), sev);
        }

        let mut triggers: HashMap<&str, Arc<dyn Trigger>> = HashMap::new();
        for definition in &self.triggers {
            let callback = log_firing(&self.name, &definition.name);
            let trigger = match &definition.kind {
                TriggerKind::Position { sev, interval } => {
                    plan.add_position_trigger(&definition.name, lookup(&sevs, sev)?, callback, *interval)
                }
                TriggerKind::SingleFire {
                    sev,
                    target,
                    tolerance,
                } => plan.add_single_fire_trigger(&definition.name, lookup(&sevs, sev)?, callback, *target, *tolerance),
                TriggerKind::Timed { period_ms } => {
                    plan.add_timed_trigger(&definition.name, callback, Duration::from_millis(*period_ms))
                }
            };
            triggers.insert(definition.name.as_str(), trigger);
        }

        for definition in &self.segments {
            let segment_triggers = definition
                .triggers
                .iter()
                .map(|name| lookup(&triggers, name).map(Arc::clone))
                .collect::<PlanResult<Vec<_>>>()?;

            match (&definition.sev, definition.limit, definition.duration_ms) {
                (Some(sev), Some(limit), _) => {
                    plan.add_segment(&definition.name, lookup(&sevs, sev)?, limit, &segment_triggers)?;
                }
                (_, _, Some(duration)) => {
                    plan.add_timed_segment(&definition.name, Duration::from_millis(duration), &segment_triggers)?;
                }
                _ => {
                    return Err(PlanError::Configuration(format!(
                        "Segment '{}' has no terminating condition",
                        definition.name
                    )))
                }
            }
        }

        plan.validate()?;
        Ok(LoadedPlan { plan, drivers })
    }
}

fn lookup<'a, T>(items: &'a HashMap<&str, T>, name: &str) -> PlanResult<&'a T> {
    items
        .get(name)
        .ok_or_else(|| PlanError::Configuration(format!("Unknown reference '{name}'")))
}

fn log_firing(plan: &str, trigger: &str) -> Triggerable {
    let (plan, trigger) = (plan.to_string(), trigger.to_string());
    Arc::new(move || info!(plan = %plan, trigger = %trigger, "Trigger fired"))
}

/// A plan built from a file, with the simulated drivers its SEVs follow.
#[derive(Debug)]
pub struct LoadedPlan {
    /// The plan
    pub plan: Arc<Plan>,
    /// Drivers backing profile SEVs
    pub drivers: Vec<ExperimentDriver<SimulatedControl>>,
}

impl LoadedPlan {
    /// Start the drivers, then the plan.
    pub fn start(&self) -> PlanResult<()> {
        for driver in &self.drivers {
            driver.start()?;
        }
        if let Err(err) = self.plan.start() {
            self.stop_drivers();
            return Err(err);
        }
        Ok(())
    }

    /// Abort every driver still running or paused.
    pub fn stop_drivers(&self) {
        for driver in &self.drivers {
            if driver.state() == DriverState::Idle {
                continue;
            }
            if let Err(err) = driver.abort() {
                warn!(driver = %driver.name(), error = %err, "Could not abort driver");
            }
        }
    }
}
