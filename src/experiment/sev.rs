//! Sample environment variables (SEVs).
//!
//! A [`SampleEnvironmentVariable`] wraps a [`SignalSource`] and pushes every
//! sampled value to its listeners (SEV-driven triggers and segments). Values
//! reach listeners in one of two ways:
//!
//! - somebody calls [`sample`](SampleEnvironmentVariable::sample), e.g. a scan
//!   loop or a test driving the signal by hand;
//! - the SEV was built [`with_polling`](SampleEnvironmentVariable::with_polling),
//!   in which case a background timer samples it while anyone is listening.
//!
//! Dispatch is synchronous and in registration order. The listener list is
//! copied before dispatch, so a listener may unregister itself (or others)
//! while being notified.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error};

use super::signal::{SevSignal, SignalSource};
use super::timer::{Schedule, Timer};

/// Receives every value sampled from an SEV.
pub trait SignalListener: Send + Sync {
    /// Called synchronously on the sampling thread.
    fn signal_changed(&self, signal: f64);
}

/// Registration handle returned by [`SampleEnvironmentVariable::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<dyn SignalListener>)>,
}

/// A named, sampled experimental condition (temperature, load, position...).
pub struct SampleEnvironmentVariable {
    name: String,
    signal: SevSignal,
    last_value: Mutex<Option<f64>>,
    listeners: RwLock<Listeners>,
    polling_period: Option<Duration>,
    poller: Mutex<Option<Timer>>,
    this: Weak<SampleEnvironmentVariable>,
}

impl SampleEnvironmentVariable {
    /// Create an SEV which is only sampled on demand.
    pub fn new(name: impl Into<String>, signal: impl SignalSource + 'static) -> Arc<Self> {
        Self::build(name.into(), Arc::new(signal), None)
    }

    /// Create an SEV which samples itself every `period` while it has listeners.
    pub fn with_polling(
        name: impl Into<String>,
        signal: impl SignalSource + 'static,
        period: Duration,
    ) -> Arc<Self> {
        Self::build(name.into(), Arc::new(signal), Some(period))
    }

    /// Create an SEV from an already shared signal.
    pub fn from_shared(name: impl Into<String>, signal: SevSignal, polling_period: Option<Duration>) -> Arc<Self> {
        Self::build(name.into(), signal, polling_period)
    }

    fn build(name: String, signal: SevSignal, polling_period: Option<Duration>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            signal,
            last_value: Mutex::new(None),
            listeners: RwLock::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            }),
            polling_period,
            poller: Mutex::new(None),
            this: this.clone(),
        })
    }

    /// Name of this SEV.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the signal now, caching the value. Listeners are not notified.
    pub fn read(&self) -> f64 {
        let value = self.signal.read();
        *self.last_value.lock() = Some(value);
        value
    }

    /// The most recently read value, if the signal was ever read.
    pub fn last_value(&self) -> Option<f64> {
        *self.last_value.lock()
    }

    /// Read the signal and notify every listener with the new value.
    pub fn sample(&self) -> f64 {
        let value = self.read();
        let snapshot: Vec<Arc<dyn SignalListener>> = self
            .listeners
            .read()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener.signal_changed(value);
        }
        value
    }

    /// Register a listener. Starts polling if this is the first listener of a
    /// polled SEV.
    pub fn add_listener(&self, listener: Arc<dyn SignalListener>) -> ListenerId {
        let (id, first) = {
            let mut listeners = self.listeners.write();
            let id = ListenerId(listeners.next_id);
            listeners.next_id += 1;
            listeners.entries.push((id, listener));
            (id, listeners.entries.len() == 1)
        };

        if first {
            self.start_polling();
        }
        id
    }

    /// Unregister a listener. Unknown ids are ignored. Stops polling when the
    /// last listener leaves.
    pub fn remove_listener(&self, id: ListenerId) {
        let now_empty = {
            let mut listeners = self.listeners.write();
            let before = listeners.entries.len();
            listeners.entries.retain(|(entry, _)| *entry != id);
            before != listeners.entries.len() && listeners.entries.is_empty()
        };

        if now_empty {
            self.stop_polling();
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().entries.len()
    }

    /// Polling period, if this SEV samples itself.
    pub fn polling_period(&self) -> Option<Duration> {
        self.polling_period
    }

    /// Whether the background poller is currently running.
    pub fn is_polling(&self) -> bool {
        self.poller.lock().is_some()
    }

    fn start_polling(&self) {
        let Some(period) = self.polling_period else {
            return;
        };
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        let sev = self.this.clone();
        let timer = Timer::start(
            format!("experiment.sev.{}", self.name),
            Schedule::FixedRate(period),
            move |_| {
                if let Some(sev) = sev.upgrade() {
                    sev.sample();
                }
            },
        );

        match timer {
            Ok(timer) => {
                debug!(sev = %self.name, ?period, "SEV polling started");
                *poller = Some(timer);
            }
            Err(err) => error!(sev = %self.name, error = %err, "Could not start SEV polling"),
        }
    }

    fn stop_polling(&self) {
        if let Some(timer) = self.poller.lock().take() {
            timer.cancel();
            debug!(sev = %self.name, "SEV polling stopped");
        }
    }
}

impl fmt::Debug for SampleEnvironmentVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleEnvironmentVariable")
            .field("name", &self.name)
            .field("last_value", &self.last_value())
            .field("listeners", &self.listener_count())
            .field("polling_period", &self.polling_period)
            .finish()
    }
}
