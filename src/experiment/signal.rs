//! Signal sources feeding sample environment variables.
//!
//! A [`SignalSource`] is a pull-based numeric reading, typically wrapping a
//! hardware position or a sensor. Any `Fn() -> f64` closure is a signal source.
//!
//! Hardware reads can fail. [`LenientSignal`] adapts a fallible reader into a
//! `SignalSource` that logs the failure and reports `0.0`, keeping monitoring
//! alive across transient glitches instead of tearing down the experiment.
//!
//! The [`sims`] module provides simulated signals for demos and tests.

use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// A zero-argument numeric signal.
pub trait SignalSource: Send + Sync {
    /// Read the current value of the signal.
    fn read(&self) -> f64;
}

impl<F> SignalSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn read(&self) -> f64 {
        self()
    }
}

/// Shared, type-erased signal source.
pub type SevSignal = Arc<dyn SignalSource>;

/// Wraps a fallible reader; failures are logged and read as `0.0`.
pub struct LenientSignal<F> {
    name: String,
    reader: F,
}

impl<F> LenientSignal<F>
where
    F: Fn() -> anyhow::Result<f64> + Send + Sync,
{
    /// Create a lenient signal named `name` (used in the warning message).
    pub fn new(name: impl Into<String>, reader: F) -> Self {
        Self {
            name: name.into(),
            reader,
        }
    }
}

impl<F> SignalSource for LenientSignal<F>
where
    F: Fn() -> anyhow::Result<f64> + Send + Sync,
{
    fn read(&self) -> f64 {
        match (self.reader)() {
            Ok(value) => value,
            Err(err) => {
                warn!(signal = %self.name, error = %err, "Could not read signal, reporting 0");
                0.0
            }
        }
    }
}

impl<F> fmt::Debug for LenientSignal<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LenientSignal")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Simulated signals.
pub mod sims {
    use parking_lot::Mutex;
    use std::sync::Arc;

    use super::SignalSource;

    /// Signal which advances by `step` on every read (negative for decreasing).
    ///
    /// The first read returns `start + step`.
    pub fn linear_evolution(start: f64, step: f64) -> LinearEvolution {
        LinearEvolution {
            start,
            step,
            position: Mutex::new(start),
        }
    }

    /// See [`linear_evolution`].
    #[derive(Debug)]
    pub struct LinearEvolution {
        start: f64,
        step: f64,
        position: Mutex<f64>,
    }

    impl LinearEvolution {
        /// Starting value (before the first read).
        pub fn start(&self) -> f64 {
            self.start
        }

        /// Increment applied on every read.
        pub fn step(&self) -> f64 {
            self.step
        }
    }

    impl SignalSource for LinearEvolution {
        fn read(&self) -> f64 {
            let mut position = self.position.lock();
            *position += self.step;
            *position
        }
    }

    /// Signal evaluating `function` at x = 1, 2, 3, … on successive reads.
    pub fn from_function<F>(function: F) -> FunctionSignal<F>
    where
        F: Fn(f64) -> f64 + Send + Sync,
    {
        FunctionSignal {
            function,
            x: Mutex::new(0.0),
        }
    }

    /// See [`from_function`].
    pub struct FunctionSignal<F> {
        function: F,
        x: Mutex<f64>,
    }

    impl<F> SignalSource for FunctionSignal<F>
    where
        F: Fn(f64) -> f64 + Send + Sync,
    {
        fn read(&self) -> f64 {
            let x = {
                let mut x = self.x.lock();
                *x += 1.0;
                *x
            };
            (self.function)(x)
        }
    }

    /// Signal driven by hand. Clones share the same value.
    #[derive(Debug, Clone, Default)]
    pub struct ManualSignal {
        value: Arc<Mutex<f64>>,
    }

    impl ManualSignal {
        /// Create a knob reading `initial`.
        pub fn new(initial: f64) -> Self {
            Self {
                value: Arc::new(Mutex::new(initial)),
            }
        }

        /// Move the knob.
        pub fn set(&self, value: f64) {
            *self.value.lock() = value;
        }
    }

    impl SignalSource for ManualSignal {
        fn read(&self) -> f64 {
            *self.value.lock()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sims::*;
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn closures_are_signal_sources() {
        let source: SevSignal = Arc::new(|| 4.2);
        assert_eq!(source.read(), 4.2);
    }

    #[traced_test]
    #[test]
    fn lenient_signal_reports_zero_on_failure() {
        let failing = LenientSignal::new("stage_x", || Err(anyhow::anyhow!("device timeout")));
        assert_eq!(failing.read(), 0.0);
        assert!(logs_contain("Could not read signal"));
        assert!(logs_contain("device timeout"));

        let healthy = LenientSignal::new("stage_y", || Ok(12.5));
        assert_eq!(healthy.read(), 12.5);
    }

    #[test]
    fn linear_evolution_advances_each_read() {
        let signal = linear_evolution(10.0, -2.5);
        assert_eq!(signal.read(), 7.5);
        assert_eq!(signal.read(), 5.0);
        assert_eq!(signal.read(), 2.5);
    }

    #[test]
    fn function_signal_counts_from_one() {
        let squares = from_function(|x| x * x);
        assert_eq!(squares.read(), 1.0);
        assert_eq!(squares.read(), 4.0);
        assert_eq!(squares.read(), 9.0);
    }

    #[test]
    fn manual_signal_clones_share_value() {
        let knob = ManualSignal::new(1.0);
        let view = knob.clone();
        knob.set(3.5);
        assert_eq!(view.read(), 3.5);
    }
}
