//! Change-triggered build scheduling for kiln.
//!
//! Schedulers turn a stream of changes into build requests: the classifier
//! decides which changes matter, the gate waits for the tree to settle, and
//! the multiplier (or a chooser) writes requests and retires changes in one
//! transaction. The floor maintainer runs beside them and keeps builders
//! supplied with pending work.

pub mod chooser;
pub mod classifier;
pub mod config;
pub mod floor;
pub mod gate;
pub mod multiplier;
pub mod patterns;
pub mod scheduler;
pub mod service;

pub use chooser::{BuilderAssignment, BuilderChooser, ChooserPlanner, FnChooser, PathRuleChooser};
pub use classifier::ChangeClassifier;
pub use config::SchedulerConfig;
pub use floor::{BaselineStamp, FixedStamp, FloorMaintainer, StampFactory};
pub use gate::{GateDecision, StabilityMode};
pub use multiplier::{RequestMultiplier, RequestPlan, RequestTemplate};
pub use scheduler::{ChangeScheduler, Scheduler, Targeting, TickOutcome};
pub use service::{ChangeNotifier, SchedulerService};
