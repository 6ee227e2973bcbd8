//! # Tally Core
//!
//! The durable bill machine and the billing service that fronts it.
//!
//! - [`runtime`]: the in-process machine substrate: signal channels,
//!   queries, activity retry, execution timeouts
//! - [`machine`]: the per-bill selection loop owning authoritative state
//! - [`activities`]: the repository side effects the machine drives
//! - [`service`]: request routing and machine/repository reconciliation

pub mod activities;
pub mod machine;
pub mod runtime;
pub mod service;

pub use activities::BillingActivities;
pub use machine::{BillMachine, MachineSignal};
pub use runtime::{
    ActivityOptions, Clock, MachineRuntime, RetryPolicy, StartOptions, SystemClock,
};
pub use service::BillingService;
