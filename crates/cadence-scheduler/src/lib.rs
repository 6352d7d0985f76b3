//! `cadence-scheduler`: persistent job scheduler with SQLite storage.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table managed by [`store::JobStore`]. The
//! [`engine::SchedulerEngine`] polls the store every `poll_interval`, claims
//! each due job in its own transaction, advances it to its next occurrence and
//! only then hands the payload to a [`sink::DispatchSink`]. An occurrence is
//! dispatched at most once: a failed or timed-out enqueue is logged, never
//! replayed.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                                       |
//! |------------|-----------------------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant                          |
//! | `Interval` | Every N seconds/minutes/hours/days/weeks, optional repeat limit |
//! | `Cron`     | 5/6-field cron expression in an IANA timezone, DST-aware        |

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod sink;
pub mod store;
pub mod types;

pub use engine::{EngineConfig, EngineHealth, EngineState, SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use sink::{ChannelSink, DispatchError, DispatchSink, Enqueued, SinkError};
pub use store::{JobStore, StoreOptions};
pub use types::{Claim, IntervalUnit, Job, JobEdit, JobStatus, NewJob, Period, Schedule, ScheduleKind};
