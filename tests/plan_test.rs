//! Integration tests for plan execution.
//!
//! Most tests drive SEVs by hand (`sample()` on the test thread) so that the
//! whole segment chain runs synchronously and deterministically.

mod common;

use common::CapturingTerminal;
use daq_plan::experiment::sims::ManualSignal;
use daq_plan::experiment::{
    DataDirectory, DefaultPlanFactory, ExperimentEvent, LimitCondition, Limit, LocalDataDirectory, Plan, PlanEvent,
    PlanFactory, PlanRegistrar, PlanServices, SampleEnvironmentVariable, Segment, SegmentState, SevSignal, Trigger,
    Triggerable,
};
use daq_plan::PlanError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Fixture {
    plan: Arc<Plan>,
    knob: ManualSignal,
    sev: Arc<SampleEnvironmentVariable>,
    data_directory: Arc<LocalDataDirectory>,
    terminal: Arc<CapturingTerminal>,
}

/// Heat to 50 then cool to 20, collecting "xrd" every 10 degrees.
fn heat_and_cool() -> Fixture {
    let data_directory = Arc::new(LocalDataDirectory::new("/dls/i15/data"));
    let terminal = Arc::new(CapturingTerminal::default());
    let plan = Plan::with_services(
        "heat and cool",
        PlanServices {
            data_directory: data_directory.clone(),
            terminal: terminal.clone(),
        },
    );

    let knob = ManualSignal::new(0.0);
    let sev = plan.add_sev("temperature", Arc::new(knob.clone()), None);
    let xrd = plan.add_position_trigger("xrd", &sev, Arc::new(|| {}), 10.0);
    plan.add_segment("heat", &sev, Limit::Above { value: 50.0 }, &[xrd.clone()])
        .unwrap();
    plan.add_segment("cool", &sev, Limit::Below { value: 20.0 }, &[xrd])
        .unwrap();

    Fixture {
        plan,
        knob,
        sev,
        data_directory,
        terminal,
    }
}

impl Fixture {
    fn drive(&self, values: &[f64]) {
        for value in values {
            self.knob.set(*value);
            self.sev.sample();
        }
    }
}

#[test]
fn plan_without_segments_does_not_start() {
    let plan = Plan::new("empty");
    plan.add_sev("temperature", Arc::new(|| 0.0), None);

    let err = plan.start().unwrap_err();
    assert!(matches!(err, PlanError::NoSegments));
    assert_eq!(err.to_string(), "No segments defined!");
    assert!(!plan.is_running());
    assert!(matches!(plan.experiment_record(), Err(PlanError::NeverRun(_))));
}

#[test]
fn duplicate_segment_names_fail_before_activation() {
    let plan = Plan::new("duplicates");
    let sev = plan.add_sev("temperature", Arc::new(|| 0.0), None);
    let first = plan.add_segment("ramp", &sev, Limit::Above { value: 1.0 }, &[]).unwrap();
    let second = plan.add_segment("ramp", &sev, Limit::Above { value: 2.0 }, &[]).unwrap();

    assert!(matches!(plan.start(), Err(PlanError::DuplicateSegmentName(name)) if name == "ramp"));
    assert_eq!(first.state(), SegmentState::Inactive);
    assert_eq!(second.state(), SegmentState::Inactive);
    assert_eq!(sev.listener_count(), 0);
    assert!(!plan.is_running());
}

#[test]
fn duplicate_trigger_names_fail_before_activation() {
    let plan = Plan::new("duplicates");
    let sev = plan.add_sev("temperature", Arc::new(|| 0.0), None);
    let a = plan.add_position_trigger("xrd", &sev, Arc::new(|| {}), 1.0);
    let b = plan.add_timed_trigger("xrd", Arc::new(|| {}), Duration::from_millis(10));
    plan.add_segment("ramp", &sev, Limit::Above { value: 1.0 }, &[a.clone(), b.clone()])
        .unwrap();

    assert!(matches!(plan.start(), Err(PlanError::DuplicateTriggerName(name)) if name == "xrd"));
    assert!(!a.is_enabled());
    assert!(!b.is_enabled());
}

#[test]
fn record_holds_segments_and_triggers_in_order() {
    let fixture = heat_and_cool();
    let plan = &fixture.plan;

    plan.start().unwrap();
    assert!(plan.is_running());
    assert_eq!(plan.active_segment().as_deref(), Some("heat"));
    assert!(matches!(plan.experiment_record(), Err(PlanError::StillRunning(_))));

    fixture.drive(&[10.0, 20.0, 30.0, 40.0, 50.0]);
    assert_eq!(plan.active_segment().as_deref(), Some("cool"));
    fixture.drive(&[40.0, 30.0, 20.0]);

    assert!(!plan.is_running());
    let record = plan.experiment_record().unwrap();
    assert!(record.is_finished());

    let kinds: Vec<String> = record
        .events()
        .iter()
        .map(|event| match event {
            ExperimentEvent::SegmentActivated { segment, .. } => format!("activated {segment}"),
            ExperimentEvent::SegmentComplete { segment, .. } => format!("complete {segment}"),
            ExperimentEvent::TriggerOccurred { trigger, .. } => format!("trigger {trigger}"),
        })
        .collect();
    let mut expected = vec!["activated heat".to_string()];
    expected.extend(std::iter::repeat("trigger xrd".to_string()).take(5));
    expected.push("complete heat".into());
    expected.push("activated cool".into());
    expected.extend(std::iter::repeat("trigger xrd".to_string()).take(3));
    expected.push("complete cool".into());
    assert_eq!(kinds, expected);

    let segments = record.segment_records();
    assert_eq!(segments[0].termination_signal, Some(50.0));
    assert_eq!(segments[1].termination_signal, Some(20.0));
    assert_eq!(segments[1].sample_environment_name.as_deref(), Some("temperature"));

    let triggers = record.trigger_records();
    let signals: Vec<f64> = triggers.iter().map(|t| t.triggering_signal).collect();
    assert_eq!(signals, vec![10.0, 20.0, 30.0, 40.0, 50.0, 40.0, 30.0, 20.0]);
    assert!(triggers[..5].iter().all(|t| t.segment_name.as_deref() == Some("heat")));
    assert!(triggers[5..].iter().all(|t| t.segment_name.as_deref() == Some("cool")));
    assert_eq!(record.trigger_count("xrd"), 8);
}

#[test]
fn triggers_are_disabled_after_their_segment() {
    let fixture = heat_and_cool();
    fixture.plan.start().unwrap();
    fixture.drive(&[50.0, 20.0]);

    assert!(fixture.plan.triggers().iter().all(|t| !t.is_enabled()));
    assert!(fixture
        .plan
        .segments()
        .iter()
        .all(|s| s.state() == SegmentState::Complete));
    assert_eq!(fixture.sev.listener_count(), 0);

    fixture.drive(&[60.0, 0.0]);
    assert_eq!(fixture.plan.experiment_record().unwrap().trigger_count("xrd"), 2);
}

#[test]
fn data_directory_follows_the_experiment() {
    let fixture = heat_and_cool();
    let root = PathBuf::from("/dls/i15/data");

    fixture.plan.start().unwrap();
    let experiment_dir = root.join("heat_and_cool");
    assert_eq!(fixture.data_directory.output_directory(), experiment_dir);
    assert_eq!(fixture.plan.experiment_data_dir(), Some(experiment_dir.clone()));

    fixture.drive(&[10.0]);
    assert_eq!(
        fixture.data_directory.output_directory(),
        experiment_dir.join("heat").join("xrd")
    );

    fixture.drive(&[50.0, 20.0]);
    assert_eq!(fixture.data_directory.output_directory(), root);
}

#[test]
fn banners_announce_start_and_end() {
    let fixture = heat_and_cool();
    fixture.plan.start().unwrap();
    assert_eq!(fixture.terminal.0.lock().len(), 1);

    fixture.drive(&[50.0, 20.0]);
    let printed = fixture.terminal.0.lock();
    assert_eq!(printed.len(), 2);
    assert!(printed[0].contains("# Plan 'heat and cool' execution started #"));
    assert!(printed[1].contains("# Plan 'heat and cool' execution complete #"));
}

#[test]
fn running_plan_rejects_second_start() {
    let fixture = heat_and_cool();
    fixture.plan.start().unwrap();

    assert!(matches!(fixture.plan.start(), Err(PlanError::AlreadyRunning(_))));
    assert!(!fixture.plan.wait_for_completion(Duration::from_millis(20)));

    fixture.drive(&[50.0, 20.0]);
    assert!(fixture.plan.wait_for_completion(Duration::from_millis(20)));
}

#[test]
fn finished_plan_can_run_again() {
    let fixture = heat_and_cool();
    fixture.plan.start().unwrap();
    fixture.drive(&[50.0, 20.0]);
    let first = fixture.plan.experiment_record().unwrap();

    fixture.plan.start().unwrap();
    fixture.drive(&[50.0, 20.0]);
    let second = fixture.plan.experiment_record().unwrap();

    assert_ne!(first.run_uid, second.run_uid);
    assert_eq!(second.segment_records().len(), 2);
}

#[test]
fn last_sev_feeds_segment() {
    let plan = Plan::new("last sev");
    let knob = ManualSignal::new(5.0);
    plan.add_sev("ignored", Arc::new(|| 0.0), None);
    let sev = plan.add_sev("strain", Arc::new(knob.clone()), None);
    plan.add_segment_on_last_sev("stretch", Limit::ChangeOf { delta: 2.0 }, &[])
        .unwrap();

    plan.start().unwrap();
    knob.set(6.0);
    sev.sample();
    assert!(plan.is_running());
    knob.set(7.5);
    sev.sample();
    assert!(!plan.is_running());

    let record = plan.experiment_record().unwrap();
    assert_eq!(record.segment_records()[0].termination_signal, Some(7.5));
}

#[test]
fn custom_limit_condition() {
    let plan = Plan::new("custom");
    let knob = ManualSignal::new(0.0);
    let sev = plan.add_sev("load", Arc::new(knob.clone()), None);
    let doubled = |start: f64, signal: f64| signal >= 2.0 * start.max(1.0);
    plan.add_segment("double", &sev, doubled, &[]).unwrap();

    plan.start().unwrap();
    knob.set(1.5);
    sev.sample();
    assert!(plan.is_running());
    knob.set(2.0);
    sev.sample();
    assert!(!plan.is_running());
}

#[test]
fn timed_plan_completes_on_its_own() {
    let shots = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&shots);

    let plan = Plan::new("soak");
    let snap = plan.add_timed_trigger(
        "snap",
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        Duration::from_millis(10),
    );
    plan.add_timed_segment("soak", Duration::from_millis(60), &[snap.clone()])
        .unwrap();
    plan.add_timed_segment("rest", Duration::from_millis(20), &[]).unwrap();

    plan.start().unwrap();
    assert!(plan.wait_for_completion(Duration::from_secs(5)));
    assert!(!snap.is_enabled());

    let record = plan.experiment_record().unwrap();
    let segments = record.segment_records();
    assert_eq!(segments.len(), 2);
    assert!(segments[0].termination_signal.unwrap() >= 60.0);
    assert!(segments[1].termination_signal.unwrap() >= 20.0);
    assert!(record.trigger_count("snap") >= 1);
    assert!(shots.load(Ordering::SeqCst) >= record.trigger_count("snap"));
}

#[test]
fn polled_sev_drives_plan() {
    let plan = Plan::new("polled");
    let knob = ManualSignal::new(0.0);
    let sev = plan.add_sev("load", Arc::new(knob.clone()), Some(Duration::from_millis(5)));
    plan.add_segment("ramp", &sev, Limit::Above { value: 3.0 }, &[]).unwrap();

    plan.start().unwrap();
    assert!(sev.is_polling());
    knob.set(3.0);

    assert!(plan.wait_for_completion(Duration::from_secs(5)));
    assert!(!sev.is_polling());
}

#[tokio::test]
async fn event_stream_mirrors_the_record() {
    let fixture = heat_and_cool();
    let mut events = fixture.plan.subscribe();

    fixture.plan.start().unwrap();
    fixture.drive(&[25.0, 50.0, 20.0]);

    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event stream stalled")
            .unwrap();
        let finished = matches!(event, PlanEvent::Finished { .. });
        received.push(event);
        if finished {
            break;
        }
    }

    let record = fixture.plan.experiment_record().unwrap();
    assert!(matches!(&received[0], PlanEvent::Started { run_uid, .. } if *run_uid == record.run_uid));
    let streamed: Vec<ExperimentEvent> = received
        .iter()
        .filter_map(|event| match event {
            PlanEvent::Record(event) => Some(event.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, record.events());
}

/// Factory counting what it builds, delegating to the default one.
struct CountingFactory {
    inner: DefaultPlanFactory,
    built: Arc<AtomicUsize>,
}

impl PlanFactory for CountingFactory {
    fn set_registrar(&mut self, registrar: Weak<dyn PlanRegistrar>) {
        self.inner.set_registrar(registrar);
    }

    fn add_sev(&self, name: &str, signal: SevSignal, polling_period: Option<Duration>) -> Arc<SampleEnvironmentVariable> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner.add_sev(name, signal, polling_period)
    }

    fn add_segment(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        limit: Box<dyn LimitCondition>,
        triggers: Vec<Arc<dyn Trigger>>,
    ) -> Arc<dyn Segment> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner.add_segment(name, sev, limit, triggers)
    }

    fn add_timed_segment(&self, name: &str, duration: Duration, triggers: Vec<Arc<dyn Trigger>>) -> Arc<dyn Segment> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner.add_timed_segment(name, duration, triggers)
    }

    fn add_position_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_interval: f64,
    ) -> Arc<dyn Trigger> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner.add_position_trigger(name, sev, triggerable, trigger_interval)
    }

    fn add_single_fire_trigger(
        &self,
        name: &str,
        sev: Arc<SampleEnvironmentVariable>,
        triggerable: Triggerable,
        trigger_signal: f64,
        tolerance: f64,
    ) -> Arc<dyn Trigger> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner
            .add_single_fire_trigger(name, sev, triggerable, trigger_signal, tolerance)
    }

    fn add_timed_trigger(&self, name: &str, triggerable: Triggerable, period: Duration) -> Arc<dyn Trigger> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.inner.add_timed_trigger(name, triggerable, period)
    }
}

#[test]
fn custom_factory_is_bound_to_the_plan() {
    let built = Arc::new(AtomicUsize::new(0));
    let plan = Plan::with_factory(
        "factory",
        PlanServices::default(),
        Box::new(CountingFactory {
            inner: DefaultPlanFactory::default(),
            built: Arc::clone(&built),
        }),
    );

    let knob = ManualSignal::new(0.0);
    let sev = plan.add_sev("load", Arc::new(knob.clone()), None);
    let melt = plan.add_single_fire_trigger("melt", &sev, Arc::new(|| {}), 5.0, 0.5);
    plan.add_segment("ramp", &sev, Limit::Above { value: 10.0 }, &[melt]).unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 3);

    plan.start().unwrap();
    for value in [4.0, 5.2, 5.4, 10.0] {
        knob.set(value);
        sev.sample();
    }

    let record = plan.experiment_record().unwrap();
    assert_eq!(record.trigger_count("melt"), 1);
    assert_eq!(record.trigger_records()[0].triggering_signal, 5.2);
}
