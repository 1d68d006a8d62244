//! # daq-plan
//!
//! Execution engine for experiment plans: an ordered chain of segments, each
//! bounded by a limit on a sample environment variable (load, temperature,
//! position...) or by time, with triggers that launch measurements as the
//! sample environment evolves.
//!
//! ## Crate Structure
//!
//! - **`experiment`**: The engine. Signals and SEVs, triggers, segments, the
//!   `Plan` orchestrator and its `ExperimentRecord`, plus experiment drivers
//!   following piecewise-linear profiles.
//! - **`plan_file`**: Declarative TOML plan definitions built into live plans.
//! - **`config`**: Application configuration loaded with `figment`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`error`**: The `PlanError` enum shared across the crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daq_plan::experiment::{sims, Limit, Plan};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> daq_plan::PlanResult<()> {
//! let plan = Plan::new("heating");
//! let temperature = plan.add_sev(
//!     "temperature",
//!     Arc::new(sims::linear_evolution(300.0, 0.5)),
//!     Some(Duration::from_millis(10)),
//! );
//! let xrd = plan.add_position_trigger("xrd", &temperature, Arc::new(|| {}), 10.0);
//! plan.add_segment("heat", &temperature, Limit::Above { value: 400.0 }, &[xrd])?;
//! plan.start()?;
//! plan.wait_for_completion(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod plan_file;

pub use error::{PlanError, PlanResult};
pub use experiment::{Plan, PlanEvent};
