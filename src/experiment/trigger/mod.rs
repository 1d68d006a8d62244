//! Triggers: rules that invoke a callback when a signal or elapsed time
//! satisfies a condition.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────┐  set_enabled(true)   ┌─────────┐
//! │ Disabled │─────────────────────▶│ Enabled │──┐ signal / tick
//! └──────────┘                      └─────────┘  │ fire: record, then callback
//!      ▲        set_enabled(false)       │  ▲    │
//!      └─────────────────────────────────┘  └────┘
//! ```
//!
//! Enabling an enabled trigger, or disabling a disabled one, is a no-op. A
//! trigger can be re-enabled any number of times, e.g. by several segments
//! sharing it; each enable starts a fresh cycle.
//!
//! Every firing reports to the registrar *before* running the user callback.
//! Panics from the callback are not caught: they unwind on whichever thread
//! fired the trigger (the SEV sampling thread or the trigger's timer thread),
//! so callers must guard their own callbacks.

mod sev_trigger;
mod timed;

pub use sev_trigger::{
    PositionCondition, PositionTrigger, SevTrigger, SingleFireCondition, SingleFireTrigger,
    TriggerCondition,
};
pub use timed::TimedTrigger;

use std::fmt;
use std::sync::{Arc, Weak};
use tracing::trace;

use super::registrar::PlanRegistrar;
use crate::error::PlanResult;

/// Callback invoked when a trigger fires.
pub type Triggerable = Arc<dyn Fn() + Send + Sync>;

/// Capability shared by all trigger variants.
pub trait Trigger: Send + Sync + fmt::Debug {
    /// Name, unique within a plan.
    fn name(&self) -> &str;

    /// Enable or disable the trigger. Idempotent.
    fn set_enabled(&self, enabled: bool) -> PlanResult<()>;

    /// Whether the trigger is currently listening.
    fn is_enabled(&self) -> bool;
}

/// State common to every trigger variant.
pub(crate) struct TriggerCore {
    name: String,
    registrar: Weak<dyn PlanRegistrar>,
    triggerable: Triggerable,
}

impl TriggerCore {
    pub(crate) fn new(name: String, registrar: Weak<dyn PlanRegistrar>, triggerable: Triggerable) -> Self {
        Self {
            name,
            registrar,
            triggerable,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Record-then-callback.
    pub(crate) fn fire(&self, trigger: &dyn Trigger, signal: f64) {
        trace!(trigger = %self.name, signal, "Trigger fired");
        if let Some(registrar) = self.registrar.upgrade() {
            registrar.trigger_occurred(trigger, signal);
        }
        (self.triggerable)();
    }
}

impl fmt::Debug for TriggerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerCore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
