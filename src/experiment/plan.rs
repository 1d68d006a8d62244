//! Plan - orchestrates a chain of segments and records what happened.
//!
//! A plan is defined up front (SEVs, triggers, segments) and then started.
//! Segments run strictly one at a time in definition order; triggers fire
//! independently while their segment is active.
//!
//! # Lifecycle
//!
//! ```text
//! ┌─────────┐  start()   ┌─────────┐  last segment complete  ┌──────────┐
//! │ Defined │───────────▶│ Running │────────────────────────▶│ Finished │
//! └─────────┘            └─────────┘                         └──────────┘
//!                             │ segment_complete()               │
//!                             └──▶ activate next segment         │ start()
//!                                                                ▼
//!                                                     fresh record, same chain
//! ```
//!
//! While running, the plan redirects the data directory: the experiment
//! writes below `<prior>/<plan>`, and each trigger event switches to
//! `<prior>/<plan>/<segment>/<trigger>`. The prior directory is restored when
//! the plan finishes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use daq_plan::experiment::{Limit, Plan};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> daq_plan::PlanResult<()> {
//! let plan = Plan::new("tensile-test");
//! let load = plan.add_sev("load", Arc::new(|| 0.0), Some(Duration::from_millis(50)));
//! let xrd = plan.add_position_trigger("xrd", &load, Arc::new(|| println!("collect")), 5.0);
//! plan.add_segment("ramp", &load, Limit::Above { value: 100.0 }, &[xrd])?;
//! plan.add_timed_segment("hold", Duration::from_secs(30), &[])?;
//!
//! plan.start()?;
//! plan.wait_for_completion(Duration::from_secs(600));
//! println!("{}", plan.experiment_record()?.summary());
//! # Ok(())
//! # }
//! ```

use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

use super::factory::{DefaultPlanFactory, PlanFactory};
use super::output::{banner, valid_name, DataDirectory, LocalDataDirectory, TerminalPrinter, TracingTerminal};
use super::record::{ExperimentEvent, ExperimentRecord};
use super::registrar::PlanRegistrar;
use super::segment::{LimitCondition, Segment};
use super::sev::SampleEnvironmentVariable;
use super::signal::SevSignal;
use super::trigger::{Trigger, Triggerable};
use crate::error::{PlanError, PlanResult};

/// Capacity of the plan event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications broadcast to [`Plan::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanEvent {
    /// The plan started; carries the run uid.
    Started {
        /// Plan name
        plan: String,
        /// Run identifier, matching the experiment record
        run_uid: String,
    },
    /// An event was appended to the experiment record.
    Record(ExperimentEvent),
    /// The last segment completed (or activation failed) and the plan stopped.
    Finished {
        /// Plan name
        plan: String,
        /// Run identifier
        run_uid: String,
    },
}

/// External collaborators of a plan.
#[derive(Clone)]
pub struct PlanServices {
    /// Data writer output location
    pub data_directory: Arc<dyn DataDirectory>,
    /// User-facing text sink
    pub terminal: Arc<dyn TerminalPrinter>,
}

impl Default for PlanServices {
    fn default() -> Self {
        Self {
            data_directory: Arc::new(LocalDataDirectory::default()),
            terminal: Arc::new(TracingTerminal),
        }
    }
}

impl fmt::Debug for PlanServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanServices")
            .field("output_directory", &self.data_directory.output_directory())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Definition {
    sevs: Vec<Arc<SampleEnvironmentVariable>>,
    segments: Vec<Arc<dyn Segment>>,
    triggers: Vec<Arc<dyn Trigger>>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    chain: VecDeque<Arc<dyn Segment>>,
    active_segment: Option<Arc<dyn Segment>>,
    record: Option<ExperimentRecord>,
    data_dir_before_experiment: PathBuf,
    experiment_data_dir: PathBuf,
}

/// An experiment plan: SEVs, triggers and an ordered chain of segments.
pub struct Plan {
    name: String,
    factory: Box<dyn PlanFactory>,
    services: PlanServices,
    definition: Mutex<Definition>,
    run: Mutex<RunState>,
    finished: Condvar,
    events: broadcast::Sender<PlanEvent>,
}

impl Plan {
    /// Plan with the default factory and collaborators.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_services(name, PlanServices::default())
    }

    /// Plan with the default factory and the given collaborators.
    pub fn with_services(name: impl Into<String>, services: PlanServices) -> Arc<Self> {
        Self::with_factory(name, services, Box::new(DefaultPlanFactory::default()))
    }

    /// Plan building its components with `factory`. The factory is bound to
    /// the new plan as registrar.
    pub fn with_factory(
        name: impl Into<String>,
        services: PlanServices,
        mut factory: Box<dyn PlanFactory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this: &Weak<Plan>| {
            factory.set_registrar(this.clone());
            Self {
                name: name.into(),
                factory,
                services,
                definition: Mutex::new(Definition::default()),
                run: Mutex::new(RunState::default()),
                finished: Condvar::new(),
                events,
            }
        })
    }

    /// Plan name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to plan events.
    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Definition
    // =========================================================================

    /// Define a sample environment variable. With `polling_period` set the SEV
    /// samples itself while a segment or trigger listens to it.
    pub fn add_sev(
        &self,
        name: &str,
        signal: SevSignal,
        polling_period: Option<Duration>,
    ) -> Arc<SampleEnvironmentVariable> {
        let sev = self.factory.add_sev(name, signal, polling_period);
        self.definition.lock().sevs.push(Arc::clone(&sev));
        sev
    }

    /// The most recently defined SEV.
    pub fn last_sev(&self) -> PlanResult<Arc<SampleEnvironmentVariable>> {
        self.definition
            .lock()
            .sevs
            .last()
            .cloned()
            .ok_or(PlanError::NoSampleEnvironment)
    }

    /// Append a segment which ends when `limit` holds for `sev`.
    pub fn add_segment(
        &self,
        name: &str,
        sev: &Arc<SampleEnvironmentVariable>,
        limit: impl LimitCondition + 'static,
        triggers: &[Arc<dyn Trigger>],
    ) -> PlanResult<Arc<dyn Segment>> {
        let segment = self
            .factory
            .add_segment(name, Arc::clone(sev), Box::new(limit), triggers.to_vec());
        self.register_segment(Arc::clone(&segment), triggers);
        Ok(segment)
    }

    /// Append a segment on the most recently defined SEV.
    pub fn add_segment_on_last_sev(
        &self,
        name: &str,
        limit: impl LimitCondition + 'static,
        triggers: &[Arc<dyn Trigger>],
    ) -> PlanResult<Arc<dyn Segment>> {
        let sev = self.last_sev()?;
        self.add_segment(name, &sev, limit, triggers)
    }

    /// Append a segment lasting `duration`.
    pub fn add_timed_segment(
        &self,
        name: &str,
        duration: Duration,
        triggers: &[Arc<dyn Trigger>],
    ) -> PlanResult<Arc<dyn Segment>> {
        let segment = self.factory.add_timed_segment(name, duration, triggers.to_vec());
        self.register_segment(Arc::clone(&segment), triggers);
        Ok(segment)
    }

    /// Define a trigger firing every `trigger_interval` of change in `sev`.
    pub fn add_position_trigger(
        &self,
        name: &str,
        sev: &Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_interval: f64,
    ) -> Arc<dyn Trigger> {
        let trigger = self
            .factory
            .add_position_trigger(name, Arc::clone(sev), triggerable, trigger_interval);
        self.definition.lock().triggers.push(Arc::clone(&trigger));
        trigger
    }

    /// Define a trigger firing once when `sev` is within `tolerance` of
    /// `trigger_signal`.
    pub fn add_single_fire_trigger(
        &self,
        name: &str,
        sev: &Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_signal: f64,
        tolerance: f64,
    ) -> Arc<dyn Trigger> {
        let trigger = self.factory.add_single_fire_trigger(
            name,
            Arc::clone(sev),
            triggerable,
            trigger_signal,
            tolerance,
        );
        self.definition.lock().triggers.push(Arc::clone(&trigger));
        trigger
    }

    /// Define a trigger firing every `period`.
    pub fn add_timed_trigger(&self, name: &str, triggerable: Triggerable, period: Duration) -> Arc<dyn Trigger> {
        let trigger = self.factory.add_timed_trigger(name, triggerable, period);
        self.definition.lock().triggers.push(Arc::clone(&trigger));
        trigger
    }

    fn register_segment(&self, segment: Arc<dyn Segment>, triggers: &[Arc<dyn Trigger>]) {
        let mut definition = self.definition.lock();
        definition.segments.push(segment);
        for trigger in triggers {
            let known = definition
                .triggers
                .iter()
                .any(|existing| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(trigger)));
            if !known {
                definition.triggers.push(Arc::clone(trigger));
            }
        }
    }

    /// Segments in execution order.
    pub fn segments(&self) -> Vec<Arc<dyn Segment>> {
        self.definition.lock().segments.clone()
    }

    /// Every trigger known to the plan.
    pub fn triggers(&self) -> Vec<Arc<dyn Trigger>> {
        self.definition.lock().triggers.clone()
    }

    /// Every SEV defined on the plan.
    pub fn sevs(&self) -> Vec<Arc<SampleEnvironmentVariable>> {
        self.definition.lock().sevs.clone()
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Validate the plan and activate its first segment.
    ///
    /// Fails without side effects if the plan is already running, has no
    /// segments, or has duplicate segment or trigger names.
    #[instrument(skip(self), fields(plan = %self.name), err)]
    pub fn start(&self) -> PlanResult<()> {
        let chain = self.segment_chain()?;

        let run_uid = {
            let mut run = self.run.lock();
            if run.running {
                return Err(PlanError::AlreadyRunning(self.name.clone()));
            }

            let data_dir = &self.services.data_directory;
            run.data_dir_before_experiment = data_dir.output_directory();
            run.experiment_data_dir = run.data_dir_before_experiment.join(valid_name(&self.name));
            data_dir.set_output_directory(&run.experiment_data_dir);

            let record = ExperimentRecord::new(self.name.clone());
            let run_uid = record.run_uid.clone();
            run.record = Some(record);
            run.chain = chain;
            run.active_segment = None;
            run.running = true;
            run_uid
        };

        info!(run_uid = %run_uid, "Plan '{}' execution started", self.name);
        self.print_banner(&format!("Plan '{}' execution started", self.name));
        let _ = self.events.send(PlanEvent::Started {
            plan: self.name.clone(),
            run_uid,
        });

        self.activate_next_segment()
    }

    /// Check the definition without starting: at least one segment, unique
    /// segment names and unique trigger names.
    pub fn validate(&self) -> PlanResult<()> {
        self.segment_chain().map(|_| ())
    }

    fn segment_chain(&self) -> PlanResult<VecDeque<Arc<dyn Segment>>> {
        let definition = self.definition.lock();
        if definition.segments.is_empty() {
            return Err(PlanError::NoSegments);
        }

        let mut names = HashSet::new();
        for segment in &definition.segments {
            if !names.insert(segment.name()) {
                return Err(PlanError::DuplicateSegmentName(segment.name().to_string()));
            }
        }

        let mut names = HashSet::new();
        for trigger in &definition.triggers {
            if !names.insert(trigger.name()) {
                return Err(PlanError::DuplicateTriggerName(trigger.name().to_string()));
            }
        }

        Ok(definition.segments.iter().cloned().collect())
    }

    fn activate_next_segment(&self) -> PlanResult<()> {
        let (segment, event) = {
            let mut run = self.run.lock();
            let Some(segment) = run.chain.pop_front() else {
                drop(run);
                self.terminate_experiment();
                return Ok(());
            };
            run.active_segment = Some(Arc::clone(&segment));
            let event = run.record.as_mut().map(|record| {
                record.segment_activated(segment.name(), segment.sample_environment_name());
                record.events().last().cloned()
            });
            (segment, event.flatten())
        };

        if let Some(event) = event {
            let _ = self.events.send(PlanEvent::Record(event));
        }
        debug!(plan = %self.name, segment = %segment.name(), "Activating segment");

        if let Err(err) = segment.activate() {
            error!(plan = %self.name, segment = %segment.name(), error = %err, "Segment activation failed, terminating plan");
            self.terminate_experiment();
            return Err(err);
        }
        Ok(())
    }

    fn terminate_experiment(&self) {
        let (summary, run_uid) = {
            let mut run = self.run.lock();
            if !run.running {
                return;
            }
            run.running = false;
            run.active_segment = None;
            run.chain.clear();
            self.services
                .data_directory
                .set_output_directory(&run.data_dir_before_experiment);

            match run.record.as_mut() {
                Some(record) => {
                    record.finish();
                    (record.summary(), record.run_uid.clone())
                }
                None => (String::new(), String::new()),
            }
        };
        self.finished.notify_all();

        info!(run_uid = %run_uid, "End of experiment '{}'", self.name);
        info!("{summary}");
        self.print_banner(&format!("Plan '{}' execution complete", self.name));
        let _ = self.events.send(PlanEvent::Finished {
            plan: self.name.clone(),
            run_uid,
        });
    }

    fn print_banner(&self, message: &str) {
        self.services.terminal.print(&banner(message));
    }

    /// Whether the plan is executing.
    pub fn is_running(&self) -> bool {
        self.run.lock().running
    }

    /// Name of the segment currently active.
    pub fn active_segment(&self) -> Option<String> {
        self.run
            .lock()
            .active_segment
            .as_ref()
            .map(|segment| segment.name().to_string())
    }

    /// Block until the plan stops running or `timeout` elapses. Returns
    /// `true` if the plan is no longer running.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut run = self.run.lock();
        while run.running {
            if self.finished.wait_until(&mut run, deadline).timed_out() {
                return !run.running;
            }
        }
        true
    }

    /// The record of the last run. Fails while the plan is running.
    pub fn experiment_record(&self) -> PlanResult<ExperimentRecord> {
        let run = self.run.lock();
        if run.running {
            return Err(PlanError::StillRunning(self.name.clone()));
        }
        run.record.clone().ok_or_else(|| PlanError::NeverRun(self.name.clone()))
    }

    /// Output directory of the current (or last) run.
    pub fn experiment_data_dir(&self) -> Option<PathBuf> {
        let run = self.run.lock();
        run.record.as_ref().map(|_| run.experiment_data_dir.clone())
    }
}

impl PlanRegistrar for Plan {
    fn trigger_occurred(&self, trigger: &dyn Trigger, triggering_signal: f64) {
        let event = {
            let mut run = self.run.lock();
            if !run.running {
                debug!(plan = %self.name, trigger = %trigger.name(), "Ignoring trigger event outside a run");
                return;
            }

            let segment_name = run.active_segment.as_ref().map(|s| s.name().to_string());
            let mut trigger_dir = run.experiment_data_dir.clone();
            if let Some(segment) = &segment_name {
                trigger_dir.push(valid_name(segment));
            }
            trigger_dir.push(valid_name(trigger.name()));
            self.services.data_directory.set_output_directory(&trigger_dir);

            run.record.as_mut().and_then(|record| {
                record.trigger_occurred(trigger.name(), segment_name.as_deref(), triggering_signal);
                record.events().last().cloned()
            })
        };

        if let Some(event) = event {
            let _ = self.events.send(PlanEvent::Record(event));
        }
    }

    fn segment_complete(&self, segment: &dyn Segment, terminating_signal: f64) {
        let event = {
            let mut run = self.run.lock();
            if !run.running {
                return;
            }
            run.record.as_mut().and_then(|record| {
                record.segment_complete(segment.name(), terminating_signal);
                record.events().last().cloned()
            })
        };

        if let Some(event) = event {
            let _ = self.events.send(PlanEvent::Record(event));
        }

        if let Err(err) = self.activate_next_segment() {
            error!(plan = %self.name, error = %err, "Could not continue plan");
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let definition = self.definition.lock();
        let sevs: Vec<&str> = definition.sevs.iter().map(|s| s.name()).collect();
        let segments: Vec<&str> = definition.segments.iter().map(|s| s.name()).collect();
        let triggers: Vec<&str> = definition.triggers.iter().map(|t| t.name()).collect();
        write!(
            f,
            "Plan [name={}, sevs={:?}, segments={:?}, triggers={:?}, running={}]",
            self.name,
            sevs,
            segments,
            triggers,
            self.is_running()
        )
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let definition = self.definition.lock();
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("sevs", &definition.sevs)
            .field("segments", &definition.segments)
            .field("triggers", &definition.triggers)
            .finish_non_exhaustive()
    }
}
