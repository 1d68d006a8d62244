//! The callback surface segments and triggers report to.

use super::segment::Segment;
use super::trigger::Trigger;

/// Receives trigger and segment events. Implemented by [`Plan`](super::Plan).
///
/// Segments and triggers hold a `Weak` reference to their registrar, so a
/// dropped plan silently stops recording instead of being kept alive by its
/// own children.
pub trait PlanRegistrar: Send + Sync {
    /// A trigger fired. Called before the trigger's callback runs.
    fn trigger_occurred(&self, trigger: &dyn Trigger, triggering_signal: f64);

    /// A segment satisfied its limit and disabled its triggers.
    fn segment_complete(&self, segment: &dyn Segment, terminating_signal: f64);
}
