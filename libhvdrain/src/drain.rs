use std::time::Instant;

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::context::DrainContext;
use crate::error::{DrainError, Result};
use crate::evacuate::{EvacuationWorker, HeldStatus};
use crate::inventory::ClusterInventory;
use crate::log::*;
use crate::model::{DrainResult, Host, MigrationJob, MigrationStatus};
use crate::retry::{self, retry_future};

/// Empties a host through a bounded pool of evacuations.
#[derive(Debug, Clone)]
pub struct HostDrainCoordinator {
    ctx: DrainContext,
    inventory: ClusterInventory,
    worker: EvacuationWorker,
}

impl HostDrainCoordinator {
    pub fn new(ctx: DrainContext) -> Self {
        Self {
            inventory: ClusterInventory::new(ctx.clone()),
            worker: EvacuationWorker::new(ctx.clone()),
            ctx,
        }
    }

    /// One pass over everything resident on `host`. At most `threads`
    /// migrations run at once; the first failure stops dispatch and the
    /// pass returns once the in-flight ones have settled.
    #[tracing::instrument(skip_all, fields(host = %host.name))]
    pub async fn drain(&self, host: &Host) -> Result<DrainResult> {
        let started = Instant::now();
        let workloads = self.inventory.resident_workloads(host).await?;
        let limit = self.ctx.options.threads.max(1);
        progress(
            2,
            format!(
                "draining {} workload(s) off {} ({} at a time)",
                workloads.len(),
                host.name,
                limit
            ),
        );

        let mut queue = workloads.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut jobs = Vec::with_capacity(workloads.len());
        let mut failure: Option<String> = None;
        loop {
            while failure.is_none() && !self.ctx.cancel.is_cancelled() && in_flight.len() < limit {
                match queue.next() {
                    Some(workload) => in_flight.push(self.worker.migrate(workload, host)),
                    None => break,
                }
            }
            let Some(job) = in_flight.next().await else {
                break;
            };
            if let MigrationStatus::Failed(reason) = &job.status {
                if failure.is_none() {
                    warn!("stopping drain of {}: {} failed", host.name, job.workload_name);
                    failure = Some(format!("{}: {}", job.workload_name, reason));
                }
            }
            jobs.push(job);
        }
        drop(in_flight);
        let attempted = jobs.len();

        if !self.ctx.dry_run() {
            for entry in self.worker.restart_held_workloads().await {
                let HeldStatus::Error(reason) = entry.status else {
                    continue;
                };
                if entry.original_host.id != host.id {
                    continue;
                }
                failure.get_or_insert_with(|| format!("{}: {}", entry.workload.name, reason));
                match jobs.iter_mut().find(|j| j.workload_id == entry.workload.id) {
                    Some(job) => job.status = MigrationStatus::Failed(reason),
                    None => {
                        let mut job = MigrationJob::new(&entry.workload, host);
                        job.status = MigrationStatus::Failed(reason);
                        jobs.push(job);
                    }
                }
            }
        }
        // Counted after held workloads are started again, so one that ends
        // up back on this host is seen.
        let remaining = self.inventory.resident_count(host).await?;

        let success = failure.is_none() && (self.ctx.dry_run() || remaining == 0);
        let result = DrainResult {
            host_id: host.id.clone(),
            host_name: host.name.clone(),
            attempted,
            remaining,
            elapsed: started.elapsed(),
            success,
            failure,
            jobs,
        };
        if result.success {
            info!("drained {} in {:?}", host.name, result.elapsed);
        } else {
            warn!(
                "{} still has {} workload(s) after drain: {}",
                host.name,
                result.remaining,
                result.failure.as_deref().unwrap_or("workloads left behind")
            );
        }
        Ok(result)
    }

    /// Drain with the run's attempt budget and backoff. An unsuccessful final
    /// pass becomes the error describing why.
    pub async fn drain_with_retries(&self, host: &Host) -> Result<DrainResult> {
        let attempts = if self.ctx.dry_run() {
            1
        } else {
            self.ctx.options.drain_attempts.max(1)
        };
        retry_future(
            |attempt| async move {
                if attempt > 0 {
                    progress(2, format!("drain attempt {} of {} for {}", attempt + 1, attempts, host.name));
                }
                let result = self.drain(host).await?;
                if result.success {
                    Ok(result)
                } else {
                    Err(drain_failure(host, &result))
                }
            },
            retry::fixed_backoff(attempts, self.ctx.options.drain_backoff),
        )
        .await
    }
}

fn drain_failure(host: &Host, result: &DrainResult) -> DrainError {
    let failed = result.failed_jobs().find_map(|job| match &job.status {
        MigrationStatus::Failed(reason) => Some((job, reason)),
        _ => None,
    });
    match failed {
        Some((job, reason)) if reason == "no capacity" => DrainError::CapacityExhausted {
            cluster: host.cluster_name.clone(),
            workload: job.workload_name.clone(),
            required: job.memory,
        },
        Some((job, reason)) => DrainError::MigrationFailed {
            host: host.name.clone(),
            workload: job.workload_name.clone(),
            reason: reason.clone(),
        },
        None => DrainError::DrainStall {
            host: host.name.clone(),
            remaining: result.remaining,
        },
    }
}
