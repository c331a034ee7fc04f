//! Task registry and background scheduler.
//!
//! The registry owns every live task, grouped by owner identity. The
//! scheduler wakes on a fixed tick, processes the tasks that are due, and
//! reports each outcome on a channel.

pub mod registry;
pub mod runner;

pub use registry::TaskRegistry;
pub use runner::{
    RunHistory, Scheduler, SchedulerEvent, TaskRunOutcome, TaskRunRecord, TickSummary,
};
