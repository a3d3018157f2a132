//! Opsched: in-process background task scheduler.

pub mod config;
pub mod error;
pub mod worker;

pub use config::{BackpressurePolicy, SchedulerConfig};
pub use error::{Error, Result};
pub use worker::{Scheduler, TaskEvent, TaskRequest};
