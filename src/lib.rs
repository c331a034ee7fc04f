//! Introducer: persistent, time-driven introduction tasks for identities in
//! a trust network.
//!
//! An identity that has written messages but is trusted by too few peers is
//! asked to solve introduction puzzles. Each identity owns one
//! [`IntroduceIdentityTask`] that re-evaluates this on a fixed interval,
//! survives restarts through a [`TaskStore`], and counts down as the user
//! solves puzzles.
//!
//! # Architecture
//!
//! - **Tasks** ([`task`]): the [`PersistentTask`] contract and the
//!   introduction state machine
//! - **Store** ([`store`]): durable commits of task records, backed by SQLite
//! - **Signals** ([`signals`]): message counts, trust counts and live config,
//!   consulted while processing
//! - **Scheduler** ([`scheduler`]): the per-owner registry and the tick loop
//!   that processes due tasks

pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::SchedulerConfig;
pub use error::{Result, SignalError, TaskError};
pub use scheduler::{RunHistory, Scheduler, SchedulerEvent, TaskRegistry};
pub use signals::{Collaborators, ConfigSource, MessageSource, TrustSource};
pub use store::{SqliteTaskStore, TaskStore};
pub use task::{IntroduceIdentityTask, OwnerId, PersistentTask, TaskId, TaskRecord, TaskView};
