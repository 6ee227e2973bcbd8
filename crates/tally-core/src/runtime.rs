//! Machine runtime
//!
//! The in-process substrate the bill machines run on. It provides the
//! guarantees the machines are written against: per-instance signal
//! channels delivered in arrival order, side-effect-free queries against a
//! snapshot, activity execution with retry and per-attempt timeout, and a
//! total execution timeout that cancels a runaway instance.
//!
//! No substrate vocabulary leaks past this module and [`crate::machine`]:
//! the billing service only ever starts, signals, and queries instances by
//! workflow id.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use tally_common::config::RetryPolicyConfig;
use tally_common::{Bill, BillingError, Result};

use crate::machine::{BillMachine, MachineSignal};

/// Time source for machines; injected so tests can run simulated clocks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Activity retry discipline: exponential backoff between attempts until
/// success or exhaustion
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryPolicyConfig) -> Self {
        Self {
            initial_interval: Duration::from_secs(cfg.initial_interval_secs),
            backoff_coefficient: cfg.backoff_coefficient,
            maximum_interval: Duration::from_secs(cfg.maximum_interval_secs),
            maximum_attempts: cfg.maximum_attempts.max(1),
        }
    }

    /// Backoff to apply after the given attempt number (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        Duration::from_secs_f64(secs).min(self.maximum_interval)
    }
}

/// Options applied to every activity invocation
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Per-attempt timeout
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Run an activity under the retry policy. Each attempt is bounded by the
/// start-to-close timeout; the error of the final attempt surfaces on
/// exhaustion.
pub async fn execute_activity<T, F, Fut>(
    options: &ActivityOptions,
    activity: &str,
    mut run: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        let outcome = match tokio::time::timeout(options.start_to_close_timeout, run()).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::ActivityTimeout(format!(
                "{activity} exceeded start-to-close timeout"
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= options.retry.maximum_attempts => {
                error!(activity, attempt, error = %err, "activity retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let backoff = options.retry.backoff(attempt);
                warn!(
                    activity,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "activity failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Options for starting a machine instance
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Bounds the whole run; the substrate cancels the machine on expiry
    pub execution_timeout: Duration,
}

struct MachineEntry {
    signal_tx: mpsc::UnboundedSender<MachineSignal>,
    snapshot_rx: watch::Receiver<Bill>,
}

/// Registry of live machine instances keyed by workflow id
pub struct MachineRuntime {
    machines: DashMap<String, MachineEntry>,
    clock: Arc<dyn Clock>,
}

impl MachineRuntime {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            machines: DashMap::new(),
            clock,
        })
    }

    pub fn with_system_clock() -> Arc<Self> {
        Self::new(Arc::new(SystemClock))
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Spawn a machine instance. Fails if the workflow id is already
    /// active; this is how one-machine-per-bill is enforced.
    pub fn start(
        self: &Arc<Self>,
        workflow_id: &str,
        machine: BillMachine,
        options: StartOptions,
    ) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.machines.entry(workflow_id.to_string()) {
            Entry::Occupied(_) => Err(BillingError::MachineAlreadyStarted(workflow_id.to_string())),
            Entry::Vacant(slot) => {
                let (signal_tx, signal_rx) = mpsc::unbounded_channel();
                let (snapshot_tx, snapshot_rx) = watch::channel(machine.bill().clone());
                slot.insert(MachineEntry {
                    signal_tx,
                    snapshot_rx,
                });

                let runtime = Arc::clone(self);
                let id = workflow_id.to_string();
                tokio::spawn(async move {
                    let run = machine.run(signal_rx, snapshot_tx);
                    match tokio::time::timeout(options.execution_timeout, run).await {
                        Ok(Ok(())) => info!(workflow_id = %id, "machine completed"),
                        Ok(Err(e)) => error!(workflow_id = %id, error = %e, "machine aborted"),
                        Err(_) => {
                            warn!(workflow_id = %id, "machine execution timeout reached, cancelled")
                        }
                    }
                    runtime.machines.remove(&id);
                });

                Ok(())
            }
        }
    }

    /// Enqueue a signal for an active instance. Delivery order is arrival
    /// order.
    pub fn signal(&self, workflow_id: &str, signal: MachineSignal) -> Result<()> {
        let entry = self
            .machines
            .get(workflow_id)
            .ok_or_else(|| BillingError::MachineNotActive(workflow_id.to_string()))?;
        entry
            .signal_tx
            .send(signal)
            .map_err(|_| BillingError::MachineNotActive(workflow_id.to_string()))
    }

    /// Read the current bill snapshot without advancing the machine.
    pub fn query(&self, workflow_id: &str) -> Result<Bill> {
        let entry = self
            .machines
            .get(workflow_id)
            .ok_or_else(|| BillingError::MachineNotActive(workflow_id.to_string()))?;
        let bill = entry.snapshot_rx.borrow().clone();
        Ok(bill)
    }

    pub fn is_active(&self, workflow_id: &str) -> bool {
        self.machines.contains_key(workflow_id)
    }

    /// Number of live instances.
    pub fn active_count(&self) -> usize {
        self.machines.len()
    }
}
