//! Moving one workload off a host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::sync::Mutex;

use crate::context::DrainContext;
use crate::control::{wait_for_job, with_retries};
use crate::error::{is_transient, DrainError, Result, TransientApiFailure};
use crate::inventory::ClusterInventory;
use crate::log::*;
use crate::model::{
    Host, MaintenancePolicy, MigrationCandidate, MigrationJob, MigrationStatus, Workload,
    WorkloadKind,
};
use crate::placement::{dedication_allows, Placement, PlacementRequest, PlacementSelector};
use crate::retry::{self, retry_future};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeldStatus {
    Held,
    Done,
    Error(String),
}

/// A workload stopped during a drain, waiting to be started elsewhere.
#[derive(Debug, Clone)]
pub struct HeldWorkload {
    pub workload: Workload,
    pub original_host: Host,
    pub status: HeldStatus,
}

/// Workloads stopped under a ShutdownAndStart policy, keyed by workload id.
/// Shared by every clone of the worker that stopped them.
#[derive(Debug, Clone, Default)]
pub struct HeldWorkloads {
    inner: Arc<Mutex<BTreeMap<String, HeldWorkload>>>,
}

impl HeldWorkloads {
    async fn hold(&self, workload: &Workload, original_host: &Host) {
        self.inner.lock().await.insert(
            workload.id.clone(),
            HeldWorkload {
                workload: workload.clone(),
                original_host: original_host.clone(),
                status: HeldStatus::Held,
            },
        );
    }

    /// Entries not yet started again, including ones that failed before.
    async fn pending(&self) -> Vec<HeldWorkload> {
        self.inner
            .lock()
            .await
            .values()
            .filter(|h| h.status != HeldStatus::Done)
            .cloned()
            .collect()
    }

    async fn mark(&self, workload_id: &str, status: HeldStatus) {
        if let Some(entry) = self.inner.lock().await.get_mut(workload_id) {
            entry.status = status;
        }
    }

    pub async fn snapshot(&self) -> Vec<HeldWorkload> {
        self.inner.lock().await.values().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct EvacuationWorker {
    ctx: DrainContext,
    inventory: ClusterInventory,
    placement: PlacementSelector,
    held: HeldWorkloads,
}

impl EvacuationWorker {
    pub fn new(ctx: DrainContext) -> Self {
        Self {
            inventory: ClusterInventory::new(ctx.clone()),
            placement: PlacementSelector::new(ctx.clone()),
            held: HeldWorkloads::default(),
            ctx,
        }
    }

    pub fn held(&self) -> &HeldWorkloads {
        &self.held
    }

    /// Move `workload` off `source`. Never returns an error: every failure is
    /// folded into the job's status so the caller can stop its pass on it.
    #[tracing::instrument(skip_all, fields(workload = %workload.name, host = %source.name))]
    pub async fn migrate(&self, workload: &Workload, source: &Host) -> MigrationJob {
        let mut job = MigrationJob::new(workload, source);

        if !workload.is_running() {
            job.status = MigrationStatus::Skipped(format!("{:?}, nothing to move", workload.state));
            return job;
        }

        if workload.maintenance_policy == MaintenancePolicy::ShutdownAndStart {
            return self.stop_and_hold(workload, source, job).await;
        }

        let dest = match self.destination(workload, source).await {
            Ok(Some(dest)) => dest,
            Ok(None) => {
                error!("no host can take {} {}", workload.kind, workload.name);
                job.status = MigrationStatus::Failed("no capacity".into());
                return job;
            }
            Err(err) => {
                job.status = MigrationStatus::Failed(err.to_string());
                return job;
            }
        };
        job.destination = Some(dest.name.clone());

        if self.ctx.dry_run() {
            progress(
                3,
                format!("would migrate {} {} to {}", workload.kind, workload.name, dest.name),
            );
            job.status = MigrationStatus::Planned;
            return job;
        }

        if workload.iso_attached {
            self.detach_iso(workload).await;
        }

        progress(
            3,
            format!("migrating {} {} to {}", workload.kind, workload.name, dest.name),
        );
        job.status = MigrationStatus::Running;

        let mut attempts = 0;
        let dispatched = retry_future(
            |attempt| {
                attempts = attempt;
                if attempt > 0 {
                    warn!("retrying migration of {}", workload.name);
                }
                self.migrate_once(workload, &dest)
            },
            retry::immediate(self.ctx.options.api_retries, is_transient),
        )
        .await;
        job.retries = attempts;

        job.status = match dispatched {
            Ok(()) => MigrationStatus::Succeeded,
            Err(err) => {
                warn!(
                    "control plane migration of {} failed ({:#}), trying hypervisor-native migration",
                    workload.name, err
                );
                match self.native_migrate(workload, source, &dest).await {
                    Ok(()) => MigrationStatus::Succeeded,
                    Err(native) => MigrationStatus::Failed(format!("{err:#}; native: {native:#}")),
                }
            }
        };
        if let MigrationStatus::Failed(reason) = &job.status {
            error!("migration of {} failed: {}", workload.name, reason);
        }
        job
    }

    /// Start every held workload again on a host other than the one it was
    /// stopped on. A workload with nowhere else to go stays stopped and its
    /// entry is marked Error, as is one whose start fails.
    pub async fn restart_held_workloads(&self) -> Vec<HeldWorkload> {
        for entry in self.held.pending().await {
            let workload = &entry.workload;
            let status = match self
                .placement
                .select(&PlacementRequest::for_workload(workload, &entry.original_host))
                .await
            {
                Ok(Placement::Selected(dest)) => self.restart_on(workload, &dest).await,
                Ok(Placement::NotFound) => HeldStatus::Error(format!(
                    "no host other than {} can take it",
                    entry.original_host.name
                )),
                Err(err) => HeldStatus::Error(err.to_string()),
            };
            if let HeldStatus::Error(reason) = &status {
                error!("held workload {} not restarted: {}", workload.name, reason);
            }
            self.held.mark(&workload.id, status).await;
        }
        self.held.snapshot().await
    }

    async fn restart_on(&self, workload: &Workload, dest: &Host) -> HeldStatus {
        progress(
            3,
            format!("starting held {} {} on {}", workload.kind, workload.name, dest.name),
        );
        let control = &self.ctx.control;
        let started = match with_retries(&self.ctx, "startVirtualMachine", || {
            control.start_workload(workload, &dest.id)
        })
        .await
        {
            Ok(job) => wait_for_job(&self.ctx, &job).await,
            Err(err) => Err(err),
        };
        match started {
            Ok(()) => HeldStatus::Done,
            Err(err) => HeldStatus::Error(format!("{err:#}")),
        }
    }

    async fn stop_and_hold(&self, workload: &Workload, source: &Host, mut job: MigrationJob) -> MigrationJob {
        if self.ctx.dry_run() {
            progress(3, format!("would stop {} and start it again elsewhere", workload.name));
            job.status = MigrationStatus::Planned;
            return job;
        }

        progress(3, format!("stopping {} (shutdown and start policy)", workload.name));
        let control = &self.ctx.control;
        let stopped = match with_retries(&self.ctx, "stopVirtualMachine", || control.stop_workload(workload)).await {
            Ok(stop) => wait_for_job(&self.ctx, &stop).await,
            Err(err) => Err(err),
        };
        job.status = match stopped {
            Ok(()) => {
                self.held.hold(workload, source).await;
                MigrationStatus::Held
            }
            Err(err) => MigrationStatus::Failed(format!("stop failed: {err:#}")),
        };
        job
    }

    async fn destination(&self, workload: &Workload, source: &Host) -> Result<Option<Host>> {
        let timeout = self.ctx.options.call_timeout;
        tokio::time::timeout(timeout, self.lookup_destination(workload, source))
            .await
            .map_err(|_| DrainError::Timeout {
                what: format!("finding a host for {}", workload.name),
                after: timeout,
            })?
    }

    async fn lookup_destination(&self, workload: &Workload, source: &Host) -> Result<Option<Host>> {
        match workload.kind {
            WorkloadKind::Instance => Ok(self
                .placement
                .select(&PlacementRequest::for_workload(workload, source))
                .await?
                .host()),
            WorkloadKind::Router | WorkloadKind::SystemVm => {
                self.candidate_destination(workload, source).await
            }
        }
    }

    /// Routers and system VMs go where the control plane says they can,
    /// least loaded first, never next to a redundant peer.
    async fn candidate_destination(&self, workload: &Workload, source: &Host) -> Result<Option<Host>> {
        let control = &self.ctx.control;
        let candidates = with_retries(&self.ctx, "findHostsForMigration", || {
            control.find_migration_candidates(workload)
        })
        .await
        .map_err(DrainError::api("findHostsForMigration"))?;

        let (peer_hosts, peer_pods) = self.peer_placement(workload).await?;

        let mut usable: Vec<MigrationCandidate> = candidates
            .into_iter()
            .filter(|c| !c.requires_storage_motion)
            .filter(|c| c.host.cluster_id == source.cluster_id)
            .filter(|c| c.suitable)
            .filter(|c| {
                dedication_allows(
                    workload.dedication_group.as_deref(),
                    c.host.dedication_group.as_deref(),
                )
            })
            .filter(|c| c.host.id != source.id && !peer_hosts.contains(&c.host.id))
            .collect();
        usable.sort_by_key(|c| (peer_pods.contains(&c.host.pod_id), c.host.memory_allocated));

        trace!("{} candidate(s) for {}", usable.len(), workload.name);
        Ok(usable.into_iter().next().map(|c| c.host))
    }

    /// Hosts and pods of the router's redundant peers.
    async fn peer_placement(&self, workload: &Workload) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut hosts = BTreeSet::new();
        let mut pods = BTreeSet::new();
        if !workload.is_redundant_router {
            return Ok((hosts, pods));
        }
        for peer in self.inventory.redundant_peers(workload).await? {
            let Some(host_id) = peer.host_id else {
                continue;
            };
            match self.inventory.host_by_id(&host_id).await {
                Ok(host) => {
                    pods.insert(host.pod_id);
                }
                Err(err) => debug!("peer host {} not resolved: {}", host_id, err),
            }
            hosts.insert(host_id);
        }
        Ok((hosts, pods))
    }

    async fn detach_iso(&self, workload: &Workload) {
        let control = &self.ctx.control;
        let detached = match with_retries(&self.ctx, "detachIso", || control.detach_removable_media(workload)).await {
            Ok(job) => wait_for_job(&self.ctx, &job).await,
            Err(err) => Err(err),
        };
        if let Err(err) = detached {
            warn!("could not detach iso from {}, migrating anyway: {:#}", workload.name, err);
        }
    }

    async fn migrate_once(&self, workload: &Workload, dest: &Host) -> anyhow::Result<()> {
        let timeout = self.ctx.options.call_timeout;
        let job = tokio::time::timeout(
            timeout,
            self.ctx
                .control
                .migrate_workload(workload, &dest.id, workload.local_storage),
        )
        .await
        .map_err(|_| {
            anyhow::Error::new(TransientApiFailure(format!(
                "migrate call for {} timed out after {timeout:?}",
                workload.name
            )))
        })??;
        wait_for_job(&self.ctx, &job).await
    }

    async fn native_migrate(&self, workload: &Workload, source: &Host, dest: &Host) -> anyhow::Result<()> {
        let command = source
            .hypervisor
            .native_migrate_command(workload, dest)
            .ok_or_else(|| anyhow!("{} has no native migration", source.hypervisor))?;
        let out = self.ctx.remote.run_command(&source.address, &command).await?;
        if !out.success() {
            bail!("`{}` exited with {}", command, out.exit_code);
        }
        Ok(())
    }
}
