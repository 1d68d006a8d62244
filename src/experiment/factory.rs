//! Construction of plan components.
//!
//! A [`PlanFactory`] builds SEVs, segments and triggers and wires each of them
//! to the plan's registrar. [`Plan`](super::Plan) owns one factory and calls
//! [`PlanFactory::set_registrar`] with itself when it is created, so custom
//! factories (e.g. producing instrumented triggers) slot in without the plan
//! knowing the concrete types.

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::registrar::PlanRegistrar;
use super::segment::{LimitCondition, Segment, SevSegment, TimedSegment};
use super::sev::SampleEnvironmentVariable;
use super::signal::SevSignal;
use super::trigger::{PositionTrigger, SingleFireTrigger, TimedTrigger, Trigger, Triggerable};

/// Builds plan components bound to a registrar.
pub trait PlanFactory: Send + Sync {
    /// Registrar handed to every component built afterwards.
    fn set_registrar(&mut self, registrar: Weak<dyn PlanRegistrar>);

    /// Sample environment variable over `signal`, polled every
    /// `polling_period` while listened to (`None` samples on demand only).
    fn add_sev(
        &self,
        name: &str,
        signal: SevSignal,
        polling_period: Option<Duration>,
    ) -> Arc<SampleEnvironmentVariable>;

    /// Segment ending when `limit` holds for `sev`.
    fn add_segment(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        limit: Box<dyn LimitCondition>,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<dyn Segment>;

    /// Segment ending after `duration`.
    fn add_timed_segment(
        &self,
        name: &str,
        duration: Duration,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<dyn Segment>;

    /// Trigger firing every `trigger_interval` of SEV change.
    fn add_position_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_interval: f64,
    ) -> Arc<dyn Trigger>;

    /// Trigger firing once when the SEV is within `tolerance` of `trigger_signal`.
    fn add_single_fire_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_signal: f64,
        tolerance: f64,
    ) -> Arc<dyn Trigger>;

    /// Trigger firing every `period`.
    fn add_timed_trigger(&self, name: &str, triggerable: Triggerable, period: Duration) -> Arc<dyn Trigger>;
}

/// Factory producing the stock segment and trigger variants.
pub struct DefaultPlanFactory {
    registrar: Weak<dyn PlanRegistrar>,
}

impl DefaultPlanFactory {
    /// Factory bound to `registrar`.
    pub fn new(registrar: Weak<dyn PlanRegistrar>) -> Self {
        Self { registrar }
    }

    /// Registrar components are currently bound to.
    pub fn registrar(&self) -> Weak<dyn PlanRegistrar> {
        self.registrar.clone()
    }
}

impl Default for DefaultPlanFactory {
    fn default() -> Self {
        Self::new(Weak::<Unbound>::new())
    }
}

impl std::fmt::Debug for DefaultPlanFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultPlanFactory")
            .field("bound", &(self.registrar.strong_count() > 0))
            .finish()
    }
}

/// Placeholder type for a factory with no registrar yet.
struct Unbound;

impl PlanRegistrar for Unbound {
    fn trigger_occurred(&self, _: &dyn Trigger, _: f64) {}
    fn segment_complete(&self, _: &dyn Segment, _: f64) {}
}

impl PlanFactory for DefaultPlanFactory {
    fn set_registrar(&mut self, registrar: Weak<dyn PlanRegistrar>) {
        self.registrar = registrar;
    }

    fn add_sev(
        &self,
        name: &str,
        signal: SevSignal,
        polling_period: Option<Duration>,
    ) -> Arc<SampleEnvironmentVariable> {
        SampleEnvironmentVariable::from_shared(name, signal, polling_period)
    }

    fn add_segment(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        limit: Box<dyn LimitCondition>,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<dyn Segment> {
        SevSegment::new(name, self.registrar.clone(), sev, limit, triggers)
    }

    fn add_timed_segment(
        &self,
        name: &str,
        duration: Duration,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<dyn Segment> {
        TimedSegment::new(name, self.registrar.clone(), duration, triggers)
    }

    fn add_position_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_interval: f64,
    ) -> Arc<dyn Trigger> {
        PositionTrigger::new(name, self.registrar.clone(), sev, triggerable, trigger_interval)
    }

    fn add_single_fire_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_signal: f64,
        tolerance: f64,
    ) -> Arc<dyn Trigger> {
        SingleFireTrigger::new(name, self.registrar.clone(), sev, triggerable, trigger_signal, tolerance)
    }

    fn add_timed_trigger(&self, name: &str, triggerable: Triggerable, period: Duration) -> Arc<dyn Trigger> {
        TimedTrigger::new(name, self.registrar.clone(), triggerable, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::segment::Limit;

    #[test]
    fn builds_disabled_components_with_requested_names() {
        let factory = DefaultPlanFactory::default();
        let sev = factory.add_sev("temp", Arc::new(|| 300.0), None);
        let trigger = factory.add_position_trigger("xrd", sev.clone(), Arc::new(|| {}), 5.0);
        let timed = factory.add_timed_trigger("snap", Arc::new(|| {}), Duration::from_millis(10));
        let segment = factory.add_segment(
            "heat",
            sev.clone(),
            Box::new(Limit::Above { value: 400.0 }),
            vec![trigger.clone(), timed.clone()],
        );

        assert_eq!(sev.name(), "temp");
        assert_eq!(trigger.name(), "xrd");
        assert!(!trigger.is_enabled());
        assert!(!timed.is_enabled());
        assert_eq!(segment.name(), "heat");
        assert_eq!(segment.triggers().len(), 2);
        assert_eq!(segment.sample_environment_name(), Some("temp"));
    }
}
