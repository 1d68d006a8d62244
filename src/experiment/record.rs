//! Experiment record: the audit trail of one plan run.
//!
//! The record is an append-only list of [`ExperimentEvent`]s. Per-segment and
//! per-trigger views ([`SegmentRecord`], [`TriggerRecord`]) are derived from
//! it on demand. The plan only hands out copies once it has stopped running,
//! so a record obtained by a caller never changes underneath it.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// One entry of the experiment log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExperimentEvent {
    /// A segment became the active segment.
    SegmentActivated {
        /// Segment name
        segment: String,
        /// SEV monitored by the segment, if any
        sample_environment: Option<String>,
        /// When the segment was activated
        timestamp: DateTime<Utc>,
    },
    /// A segment reached its limit.
    SegmentComplete {
        /// Segment name
        segment: String,
        /// Signal value which satisfied the limit (elapsed ms for timed segments)
        terminating_signal: f64,
        /// When the segment completed
        timestamp: DateTime<Utc>,
    },
    /// A trigger fired.
    TriggerOccurred {
        /// Trigger name
        trigger: String,
        /// Segment active when the trigger fired
        segment: Option<String>,
        /// Signal value at the firing (elapsed ms for timed triggers)
        triggering_signal: f64,
        /// When the trigger fired
        timestamp: DateTime<Utc>,
    },
}

impl ExperimentEvent {
    /// When the event happened.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ExperimentEvent::SegmentActivated { timestamp, .. }
            | ExperimentEvent::SegmentComplete { timestamp, .. }
            | ExperimentEvent::TriggerOccurred { timestamp, .. } => *timestamp,
        }
    }
}

/// When a segment started and ended, and which signal ended it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Segment name
    pub segment_name: String,
    /// SEV monitored by the segment, if any
    pub sample_environment_name: Option<String>,
    /// Activation time
    pub start_time: DateTime<Utc>,
    /// Completion time, `None` if the segment never completed
    pub end_time: Option<DateTime<Utc>>,
    /// Signal which terminated the segment
    pub termination_signal: Option<f64>,
}

/// A single trigger firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    /// Trigger name
    pub trigger_name: String,
    /// Segment active at the time
    pub segment_name: Option<String>,
    /// Signal at the firing
    pub triggering_signal: f64,
    /// Firing time
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of a plan run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Unique identifier of the run
    pub run_uid: String,
    /// Plan name
    pub plan_name: String,
    /// When the plan started
    pub start_time: DateTime<Utc>,
    /// When the plan finished
    pub end_time: Option<DateTime<Utc>>,
    events: Vec<ExperimentEvent>,
}

impl ExperimentRecord {
    /// Fresh record for a run of `plan_name`.
    pub fn new(plan_name: impl Into<String>) -> Self {
        Self {
            run_uid: Uuid::new_v4().to_string(),
            plan_name: plan_name.into(),
            start_time: Utc::now(),
            end_time: None,
            events: Vec::new(),
        }
    }

    pub(crate) fn segment_activated(&mut self, segment: &str, sample_environment: Option<&str>) {
        self.events.push(ExperimentEvent::SegmentActivated {
            segment: segment.to_string(),
            sample_environment: sample_environment.map(str::to_string),
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn segment_complete(&mut self, segment: &str, terminating_signal: f64) {
        self.events.push(ExperimentEvent::SegmentComplete {
            segment: segment.to_string(),
            terminating_signal,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn trigger_occurred(&mut self, trigger: &str, segment: Option<&str>, triggering_signal: f64) {
        self.events.push(ExperimentEvent::TriggerOccurred {
            trigger: trigger.to_string(),
            segment: segment.map(str::to_string),
            triggering_signal,
            timestamp: Utc::now(),
        });
    }

    pub(crate) fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Every event, in the order it was recorded.
    pub fn events(&self) -> &[ExperimentEvent] {
        &self.events
    }

    /// Whether the run has finished.
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// One record per segment activation, in activation order.
    pub fn segment_records(&self) -> Vec<SegmentRecord> {
        let mut records: Vec<SegmentRecord> = Vec::new();
        for event in &self.events {
            match event {
                ExperimentEvent::SegmentActivated {
                    segment,
                    sample_environment,
                    timestamp,
                } => records.push(SegmentRecord {
                    segment_name: segment.clone(),
                    sample_environment_name: sample_environment.clone(),
                    start_time: *timestamp,
                    end_time: None,
                    termination_signal: None,
                }),
                ExperimentEvent::SegmentComplete {
                    segment,
                    terminating_signal,
                    timestamp,
                } => {
                    if let Some(record) = records
                        .iter_mut()
                        .rev()
                        .find(|r| &r.segment_name == segment && r.end_time.is_none())
                    {
                        record.end_time = Some(*timestamp);
                        record.termination_signal = Some(*terminating_signal);
                    }
                }
                ExperimentEvent::TriggerOccurred { .. } => {}
            }
        }
        records
    }

    /// Every trigger firing, in order.
    pub fn trigger_records(&self) -> Vec<TriggerRecord> {
        self.events
            .iter()
            .filter_map(|event| match event {
                ExperimentEvent::TriggerOccurred {
                    trigger,
                    segment,
                    triggering_signal,
                    timestamp,
                } => Some(TriggerRecord {
                    trigger_name: trigger.clone(),
                    segment_name: segment.clone(),
                    triggering_signal: *triggering_signal,
                    timestamp: *timestamp,
                }),
                _ => None,
            })
            .collect()
    }

    /// Number of firings of the trigger called `name`.
    pub fn trigger_count(&self, name: &str) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, ExperimentEvent::TriggerOccurred { trigger, .. } if trigger == name))
            .count()
    }

    /// Human-readable summary, one line per segment plus trigger totals.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Experiment '{}' (run {})", self.plan_name, self.run_uid);
        for record in self.segment_records() {
            let duration = record
                .end_time
                .map(|end| format!("{} ms", (end - record.start_time).num_milliseconds()))
                .unwrap_or_else(|| "incomplete".to_string());
            let signal = record
                .termination_signal
                .map(|s| format!("{s:.4}"))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "  segment '{}': {} (terminating signal {})",
                record.segment_name, duration, signal
            );
        }

        let mut counts: Vec<(String, usize)> = Vec::new();
        for record in self.trigger_records() {
            match counts.iter_mut().find(|(name, _)| *name == record.trigger_name) {
                Some((_, count)) => *count += 1,
                None => counts.push((record.trigger_name, 1)),
            }
        }
        for (name, count) in counts {
            let _ = writeln!(out, "  trigger '{name}': {count} event(s)");
        }
        out
    }

    /// Save the record as pretty JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize experiment record")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create record directory")?;
        }

        fs::write(&path, json)
            .with_context(|| format!("Failed to write experiment record to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load a record saved with [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read experiment record from {:?}", path.as_ref()))?;
        serde_json::from_str(&json).context("Failed to deserialize experiment record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_record() -> ExperimentRecord {
        let mut record = ExperimentRecord::new("tensile");
        record.segment_activated("ramp", Some("load"));
        record.trigger_occurred("xrd", Some("ramp"), 1.0);
        record.trigger_occurred("xrd", Some("ramp"), 2.0);
        record.segment_complete("ramp", 5.0);
        record.segment_activated("hold", None);
        record.trigger_occurred("snap", Some("hold"), 100.0);
        record.segment_complete("hold", 250.0);
        record.finish();
        record
    }

    #[test]
    fn derives_segment_records_in_order() {
        let segments = sample_record().segment_records();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].segment_name, "ramp");
        assert_eq!(segments[0].sample_environment_name.as_deref(), Some("load"));
        assert_eq!(segments[0].termination_signal, Some(5.0));
        assert_eq!(segments[1].segment_name, "hold");
        assert_eq!(segments[1].termination_signal, Some(250.0));
        assert!(segments.iter().all(|s| s.end_time.is_some()));
    }

    #[test]
    fn counts_triggers() {
        let record = sample_record();
        assert_eq!(record.trigger_count("xrd"), 2);
        assert_eq!(record.trigger_count("snap"), 1);
        assert_eq!(record.trigger_count("missing"), 0);
        assert_eq!(record.trigger_records()[2].segment_name.as_deref(), Some("hold"));
    }

    #[test]
    fn summary_mentions_segments_and_triggers() {
        let summary = sample_record().summary();
        assert!(summary.contains("segment 'ramp'"));
        assert!(summary.contains("trigger 'xrd': 2 event(s)"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        let record = sample_record();

        record.save(&path).unwrap();
        let loaded = ExperimentRecord::load(&path).unwrap();

        assert_eq!(loaded, record);
        assert!(loaded.is_finished());
    }
}
