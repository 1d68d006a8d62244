//! Experiment plan engine.
//!
//! A [`Plan`] runs an ordered chain of [`Segment`]s. Each segment is bounded
//! either by a limit on a [`SampleEnvironmentVariable`] (SEV) or by time, and
//! enables a set of [`Trigger`]s for as long as it is active. Triggers invoke
//! user callbacks (typically a measurement) when their signal crosses an
//! interval, reaches a target, or a period elapses. Every activation,
//! completion and firing is appended to an [`ExperimentRecord`].
//!
//! ```text
//!  SignalSource ──read──▶ SEV ──signal_changed──▶ SevSegment ──segment_complete──▶ Plan
//!                          │                                                      ▲
//!                          └──signal_changed──▶ PositionTrigger ─trigger_occurred─┘
//!                                                    │
//!                                                    └──▶ Triggerable callback
//! ```
//!
//! Components only talk to the plan through [`PlanRegistrar`], which the
//! [`PlanFactory`] wires in when it builds them.

pub mod driver;
pub mod factory;
pub mod output;
pub mod plan;
pub mod record;
pub mod registrar;
pub mod segment;
pub mod sev;
pub mod signal;
pub mod timer;
pub mod trigger;

pub use driver::{
    AbortCondition, DriverControl, DriverProfileSection, DriverState, ExperimentDriver,
    ExperimentDriverModel, ProfileSignal, SimulatedControl,
};
pub use factory::{DefaultPlanFactory, PlanFactory};
pub use output::{valid_name, DataDirectory, LocalDataDirectory, TerminalPrinter, TracingTerminal};
pub use plan::{Plan, PlanEvent, PlanServices};
pub use record::{ExperimentEvent, ExperimentRecord, SegmentRecord, TriggerRecord};
pub use registrar::PlanRegistrar;
pub use segment::{Limit, LimitCondition, Segment, SegmentState, SevSegment, TimedSegment};
pub use sev::{ListenerId, SampleEnvironmentVariable, SignalListener};
pub use signal::{sims, LenientSignal, SevSignal, SignalSource};
pub use timer::{Schedule, Timer};
pub use trigger::{
    PositionCondition, PositionTrigger, SevTrigger, SingleFireCondition, SingleFireTrigger,
    TimedTrigger, Trigger, TriggerCondition, Triggerable,
};
