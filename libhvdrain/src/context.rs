use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::control::ControlPlane;
use crate::executor::RemoteExecutor;
use crate::interrupt::InterruptGuard;
use crate::notify::Notifier;
use crate::poll::Poller;

/// Knobs for a run. Defaults are the production values; tests shrink the
/// intervals.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// No mutating call is issued while set. Only `--exec` clears it.
    pub dry_run: bool,
    /// Bypass the one-host-in-maintenance guard.
    pub force: bool,
    /// Concurrent migrations while draining a single host.
    pub threads: usize,
    /// Let placement pick hosts that lack a workload's required tags.
    pub allow_tag_mismatch: bool,
    /// Upper bound on a single placement or migration call.
    pub call_timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive polls with an unchanged resident count before a
    /// maintenance transition is abandoned.
    pub stall_polls: u32,
    pub drain_attempts: u32,
    pub drain_backoff: Duration,
    /// Immediate retries of a transient control plane failure.
    pub api_retries: u32,
    /// Polls for a rebooting host to drop off the network.
    pub shutdown_polls: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            force: false,
            threads: 5,
            allow_tag_mismatch: false,
            call_timeout: Duration::from_secs(900),
            poll_interval: Duration::from_secs(5),
            stall_polls: 100,
            drain_attempts: 3,
            drain_backoff: Duration::from_secs(10),
            api_retries: 1,
            shutdown_polls: 120,
        }
    }
}

/// Everything a component needs: run options plus the injected clients.
/// Cheap to clone; every component keeps its own copy.
#[derive(Clone)]
pub struct DrainContext {
    pub control: Arc<dyn ControlPlane>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub notifier: Arc<dyn Notifier>,
    pub options: RunOptions,
    pub cancel: CancellationToken,
    pub interrupts: InterruptGuard,
}

impl DrainContext {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        remote: Arc<dyn RemoteExecutor>,
        notifier: Arc<dyn Notifier>,
        options: RunOptions,
    ) -> Self {
        let interrupts = InterruptGuard::default();
        Self {
            control,
            remote,
            notifier,
            options,
            cancel: interrupts.token(),
            interrupts,
        }
    }

    /// Share `interrupts` with the run: a repeated interrupt cancels it.
    pub fn with_interrupts(mut self, interrupts: InterruptGuard) -> Self {
        self.cancel = interrupts.token();
        self.interrupts = interrupts;
        self
    }

    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    /// A poller at the run's poll interval with no iteration cap.
    pub fn poller(&self) -> Poller {
        Poller::new(self.options.poll_interval, self.cancel.clone())
    }
}

impl fmt::Debug for DrainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainContext")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
