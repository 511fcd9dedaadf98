//! Event log consumer.
//!
//! A worker runs two loops against the same consumer group:
//!
//! - The **main consumption loop** reads new entries with a blocking group read.
//! - The **reclaim loop** takes over entries that another consumer (or an
//!   earlier incarnation of this one) read but never acknowledged.
//!
//! Both hand each entry to the same [`Processor`].
//!
//! # Module Structure
//!
//! - [`config`]: Loop tuning and retry ceilings
//! - [`deferred`]: Not-yet-due entries held by the main loop
//! - [`handler`]: The business handler trait
//! - [`processor`]: Per-entry decode, schedule, schema gate and retry logic
//! - [`worker`]: The loops, fault escalation, health and shutdown

pub mod config;
pub mod deferred;
pub mod handler;
pub mod processor;
#[allow(clippy::module_inception)]
pub mod worker;


pub use config::WorkerConfig;
pub use deferred::DeferredEntries;
pub use handler::{EventHandler, HandlerError, LoggingHandler};
pub use processor::{ProcessError, ProcessOutcome, Processor};
pub use worker::{Disposition, Escalation, LoopHealth, Worker, WorkerHandle, WorkerHealth};
