use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::{Trigger, TriggerCore, Triggerable};
use crate::error::PlanResult;
use crate::experiment::registrar::PlanRegistrar;
use crate::experiment::timer::{Schedule, Timer};

/// Fires its callback every `period` while enabled.
///
/// Each enable starts a dedicated timer thread; the triggering signal is the
/// time in milliseconds since the trigger was enabled. The callback runs on
/// that timer thread.
pub struct TimedTrigger {
    core: TriggerCore,
    period: Duration,
    timer: Mutex<Option<Timer>>,
    this: Weak<TimedTrigger>,
}

impl TimedTrigger {
    /// Create a disabled timed trigger.
    pub fn new(
        name: impl Into<String>,
        registrar: Weak<dyn PlanRegistrar>,
        triggerable: Triggerable,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: TriggerCore::new(name.into(), registrar, triggerable),
            period,
            timer: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Time between firings.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Trigger for TimedTrigger {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn set_enabled(&self, enabled: bool) -> PlanResult<()> {
        let mut timer = self.timer.lock();
        if enabled == timer.is_some() {
            return Ok(());
        }

        if enabled {
            let trigger = self.this.clone();
            *timer = Some(Timer::start(
                "experiment.plan.timed.trigger",
                Schedule::FixedRate(self.period),
                move |elapsed| {
                    if let Some(trigger) = trigger.upgrade() {
                        trigger.core.fire(&*trigger, elapsed.as_secs_f64() * 1000.0);
                    }
                },
            )?);
            debug!(trigger = %self.name(), period = ?self.period, "Timed trigger enabled");
        } else if let Some(running) = timer.take() {
            running.cancel();
            debug!(trigger = %self.name(), "Timed trigger disabled");
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.timer.lock().is_some()
    }
}

impl fmt::Debug for TimedTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedTrigger")
            .field("name", &self.core.name())
            .field("period", &self.period)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
