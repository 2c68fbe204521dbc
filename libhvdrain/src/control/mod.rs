//! The control plane as the core sees it.

use std::future::Future;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::context::DrainContext;
use crate::error::{is_transient, TransientApiFailure};
use crate::log::*;
use crate::model::{
    AllocationState, AsyncJobStatus, Cluster, Host, HostFilter, HostTransition, JobId,
    ManagedState, MigrationCandidate, Workload, WorkloadFilter,
};
use crate::poll::PollOutcome;
use crate::retry::{self, retry_future};

/// Read and mutate calls against the cloud's management API. Implementations
/// deserialize into the typed records of [`crate::model`] and mark retryable
/// failures with [`TransientApiFailure`].
#[async_trait]
pub trait ControlPlane: std::fmt::Debug + Send + Sync {
    async fn list_clusters(&self, name: Option<&str>) -> Result<Vec<Cluster>>;

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>>;

    async fn list_workloads(&self, filter: &WorkloadFilter) -> Result<Vec<Workload>>;

    async fn find_migration_candidates(&self, workload: &Workload) -> Result<Vec<MigrationCandidate>>;

    async fn set_host_resource_state(&self, host_id: &str, target: HostTransition) -> Result<JobId>;

    async fn migrate_workload(
        &self,
        workload: &Workload,
        dest_host_id: &str,
        with_volume: bool,
    ) -> Result<JobId>;

    async fn poll_job(&self, job: &JobId) -> Result<AsyncJobStatus>;

    async fn set_cluster_managed_state(&self, cluster_id: &str, state: ManagedState) -> Result<()>;

    async fn set_cluster_allocation_state(
        &self,
        cluster_id: &str,
        state: AllocationState,
    ) -> Result<()>;

    /// Start a stopped workload on `host_id`.
    async fn start_workload(&self, workload: &Workload, host_id: &str) -> Result<JobId>;

    async fn stop_workload(&self, workload: &Workload) -> Result<JobId>;

    async fn detach_removable_media(&self, workload: &Workload) -> Result<JobId>;
}

/// Issue one control plane call, repeating it at once while it fails
/// transiently, at most `api_retries` more times.
pub async fn with_retries<T, F, Fut>(ctx: &DrainContext, call: &str, mut issue: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_future(
        |attempt| {
            if attempt > 0 {
                warn!("retrying {} after a transient failure", call);
            }
            issue()
        },
        retry::immediate(ctx.options.api_retries, is_transient),
    )
    .await
}

/// Wait for an async job to finish, bounded by the run's call timeout.
/// Running out of time counts as a transient failure.
pub async fn wait_for_job(ctx: &DrainContext, job: &JobId) -> Result<()> {
    let poller = ctx.poller();
    let waited = tokio::time::timeout(
        ctx.options.call_timeout,
        poller.until(|| async move {
            match with_retries(ctx, "queryAsyncJobResult", || ctx.control.poll_job(job)).await? {
                AsyncJobStatus::Pending => Ok(None),
                status => Ok(Some(status)),
            }
        }),
    )
    .await;

    match waited {
        Ok(polled) => match polled.with_context(|| format!("polling job {job}"))? {
            PollOutcome::Ready(AsyncJobStatus::Succeeded) => Ok(()),
            PollOutcome::Ready(AsyncJobStatus::Failed(reason)) => {
                anyhow::bail!("job {job} failed: {reason}")
            }
            PollOutcome::Ready(AsyncJobStatus::Pending) => unreachable!("pending is never ready"),
            PollOutcome::Exhausted | PollOutcome::Cancelled => {
                anyhow::bail!("stopped waiting for job {job}")
            }
        },
        Err(_) => Err(anyhow::Error::new(TransientApiFailure(format!(
            "job {job} still running after {:?}",
            ctx.options.call_timeout
        )))),
    }
}
