//! Rolling maintenance across a whole cluster, one host at a time.

use std::fmt;
use std::time::{Duration, Instant};

use crate::context::DrainContext;
use crate::control::with_retries;
use crate::drain::HostDrainCoordinator;
use crate::error::{DrainError, Result};
use crate::executor::hook::{HookRunner, Hooks};
use crate::hypervisor::{degraded_bond_links, RebootAction, HA_STATUS_HELPER};
use crate::inventory::ClusterInventory;
use crate::log::*;
use crate::maintenance::{MaintenanceOutcome, MaintenanceStateMachine};
use crate::model::{AllocationState, Cluster, Host, ManagedState, Outcome};
use crate::notify::{notify_quietly, Severity};
use crate::plan::{RollingPlan, Step};
use crate::poll::PollOutcome;

#[derive(Debug, Clone)]
pub struct RollingOptions {
    /// Host names left untouched.
    pub ignore_hosts: Vec<String>,
    pub reboot: RebootAction,
    pub hooks: Hooks,
    pub bond_check: bool,
    /// Keep new workloads out of the cluster while it rolls.
    pub disable_allocation: bool,
}

impl Default for RollingOptions {
    fn default() -> Self {
        Self {
            ignore_hosts: vec![],
            reboot: RebootAction::default(),
            hooks: Hooks::default(),
            bond_check: true,
            disable_allocation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Done,
    Ignored,
    /// Dry-run: the host was previewed.
    Planned,
    Failed(String),
    NotReached,
}

impl fmt::Display for HostOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostOutcome::Done => write!(f, "done"),
            HostOutcome::Ignored => write!(f, "ignored"),
            HostOutcome::Planned => write!(f, "planned"),
            HostOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            HostOutcome::NotReached => write!(f, "not reached"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostReport {
    pub host: String,
    pub outcome: HostOutcome,
    pub migrated: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub title: String,
    pub dry_run: bool,
    pub hosts: Vec<HostReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        !self
            .hosts
            .iter()
            .any(|h| matches!(h.outcome, HostOutcome::Failed(_)))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry-run)" } else { "" };
        writeln!(f, "*** summary: {}{} ***", self.title, mode)?;
        for report in &self.hosts {
            write!(f, "** {}: {}", report.host, report.outcome)?;
            if report.outcome == HostOutcome::Done {
                write!(f, " ({} migrated in {:?})", report.migrated, report.elapsed)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Drives a rolling operation over one cluster: for each host in turn,
/// drain, maintenance, reboot, wait and back to service.
#[derive(Debug, Clone)]
pub struct ClusterRollingController {
    ctx: DrainContext,
    inventory: ClusterInventory,
    drain: HostDrainCoordinator,
    maintenance: MaintenanceStateMachine,
}

impl ClusterRollingController {
    pub fn new(ctx: DrainContext) -> Self {
        Self {
            inventory: ClusterInventory::new(ctx.clone()),
            drain: HostDrainCoordinator::new(ctx.clone()),
            maintenance: MaintenanceStateMachine::new(ctx.clone()),
            ctx,
        }
    }

    #[tracing::instrument(skip(self, options))]
    pub async fn run(&self, cluster_name: &str, options: &RollingOptions) -> Result<RunSummary> {
        let cluster = self.inventory.cluster(cluster_name).await?;
        let hosts = self.inventory.hosts(&cluster.id).await?;
        let poolmaster = if cluster.hypervisor.has_poolmaster() {
            self.inventory.poolmaster(&cluster, &hosts).await
        } else {
            None
        };

        let busy: Vec<String> = hosts
            .iter()
            .filter(|h| h.resource_state.in_maintenance())
            .map(|h| h.name.clone())
            .collect();
        if busy.len() > 1 {
            if !self.ctx.options.force {
                return Err(DrainError::UnsafeClusterState {
                    cluster: cluster.name.clone(),
                    hosts: busy,
                });
            }
            warn!("forced: {} host(s) already in maintenance", busy.len());
        }

        let hosts = order_hosts(hosts, poolmaster.as_deref());
        let plan = RollingPlan::new(&cluster, &hosts, options);
        plan.print();

        if self.ctx.dry_run() {
            return self.preview(&plan, &hosts, options).await;
        }

        notify_quietly(
            self.ctx.notifier.as_ref(),
            &format!("Starting {} ({} hosts)", plan.name(), hosts.len()),
            Severity::Info,
        )
        .await;

        let allocation_disabled = options.disable_allocation
            && cluster.allocation_state == AllocationState::Enabled;
        if allocation_disabled {
            self.set_allocation_state(&cluster, AllocationState::Disabled).await?;
        }
        let heartbeat_sr = match self.disable_ha(&cluster, &hosts, poolmaster.as_deref()).await {
            Ok(sr) => sr,
            Err(err) => {
                if allocation_disabled {
                    self.restore_allocation(&cluster).await;
                }
                return Err(err);
            }
        };

        let mut reports = vec![];
        let rolled = self
            .roll_hosts(&cluster, &hosts, &plan, poolmaster.as_deref(), options, &mut reports)
            .await;

        if let Some(sr) = heartbeat_sr {
            self.enable_ha(&cluster, &hosts, poolmaster.as_deref(), &sr).await;
        }
        if allocation_disabled {
            self.restore_allocation(&cluster).await;
        }

        for host in hosts.iter().skip(reports.len()) {
            reports.push(HostReport {
                host: host.name.clone(),
                outcome: HostOutcome::NotReached,
                migrated: 0,
                elapsed: Duration::ZERO,
            });
        }
        let summary = RunSummary {
            title: plan.name().clone(),
            dry_run: false,
            hosts: reports,
        };
        print!("{summary}");

        match rolled {
            Ok(()) => {
                notify_quietly(
                    self.ctx.notifier.as_ref(),
                    &format!("Finished {}\n{}", plan.name(), summary),
                    Severity::Info,
                )
                .await;
                Ok(summary)
            }
            Err(err) => {
                notify_quietly(
                    self.ctx.notifier.as_ref(),
                    &format!("{} stopped: {}\n{}", plan.name(), err.investigate_message(), summary),
                    Severity::Critical,
                )
                .await;
                Err(err)
            }
        }
    }

    /// Read-only walk of the plan: every drain is planned, nothing moves.
    /// Hook scripts are resolved but not executed.
    async fn preview(&self, plan: &RollingPlan, hosts: &[Host], options: &RollingOptions) -> Result<RunSummary> {
        let mut reports = vec![];
        let mut hooks = HookRunner::new(true);
        for host in hosts {
            let started = Instant::now();
            let host_plan = plan.plan_for_host(&host.name);
            let mut outcome = HostOutcome::Planned;
            let mut migrated = 0;
            if host_plan.steps().any(|s| s == Step::Ignore) {
                outcome = HostOutcome::Ignored;
            } else if host_plan.steps().any(|s| s == Step::Drain) {
                let result = self.drain.drain(host).await?;
                migrated = result.jobs.len();
                if let Some(reason) = result.failure {
                    warn!("{} could not be drained: {}", host.name, reason);
                    outcome = HostOutcome::Failed(reason);
                }
            }
            for step in host_plan.steps().filter(Step::is_mutation) {
                match step {
                    Step::Hook { stage } if outcome == HostOutcome::Planned => {
                        if let Some(script) = options.hooks.for_stage(stage) {
                            hooks.run(stage, script, host).await?;
                        }
                    }
                    step => debug!("dry-run: would {} on {}", step, host.name),
                }
            }
            reports.push(HostReport {
                host: host.name.clone(),
                outcome,
                migrated,
                elapsed: started.elapsed(),
            });
        }
        let summary = RunSummary {
            title: plan.name().clone(),
            dry_run: true,
            hosts: reports,
        };
        print!("{summary}");
        Ok(summary)
    }

    async fn roll_hosts(
        &self,
        cluster: &Cluster,
        hosts: &[Host],
        plan: &RollingPlan,
        poolmaster: Option<&str>,
        options: &RollingOptions,
        reports: &mut Vec<HostReport>,
    ) -> Result<()> {
        for (i, host) in hosts.iter().enumerate() {
            if i > 0 && (self.ctx.interrupts.requested() || self.ctx.cancel.is_cancelled()) {
                warn!("stopping before {} on operator request", host.name);
                return Err(DrainError::Interrupted {
                    next_host: host.name.clone(),
                });
            }

            let host_plan = plan.plan_for_host(&host.name);
            if host_plan.steps().any(|s| s == Step::Ignore) {
                progress(1, format!("skipping {} (ignored)", host.name));
                reports.push(HostReport {
                    host: host.name.clone(),
                    outcome: HostOutcome::Ignored,
                    migrated: 0,
                    elapsed: Duration::ZERO,
                });
                continue;
            }

            let started = Instant::now();
            progress(1, format!("host {} ({}/{})", host.name, i + 1, hosts.len()));
            let unmanage = poolmaster == Some(host.name.as_str());
            if unmanage {
                self.set_managed_state(cluster, ManagedState::Unmanaged).await?;
            }
            let mut rolled = self.roll_host(host, &host_plan, options).await;
            if unmanage {
                if let Err(err) = self.set_managed_state(cluster, ManagedState::Managed).await {
                    error!("could not restore managed state of {}: {}", cluster.name, err);
                    rolled = rolled.and(Err(err));
                }
            }

            match rolled {
                Ok(migrated) => {
                    progress(1, format!("{} done", host.name));
                    reports.push(HostReport {
                        host: host.name.clone(),
                        outcome: HostOutcome::Done,
                        migrated,
                        elapsed: started.elapsed(),
                    });
                }
                Err(err) => {
                    error!("{}", err.investigate_message());
                    reports.push(HostReport {
                        host: host.name.clone(),
                        outcome: HostOutcome::Failed(err.to_string()),
                        migrated: 0,
                        elapsed: started.elapsed(),
                    });
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Execute one host's plan. Returns the number of workloads moved off.
    #[tracing::instrument(skip_all, fields(host = %host.name))]
    async fn roll_host(&self, host: &Host, plan: &RollingPlan, options: &RollingOptions) -> Result<usize> {
        let mut hooks = HookRunner::new(self.ctx.dry_run());
        let mut migrated = 0;
        for step in plan.steps() {
            debug!("{}: {}", host.name, step);
            match step {
                Step::Ignore => return Ok(0),
                Step::Hook { stage } => {
                    if let Some(script) = options.hooks.for_stage(stage) {
                        hooks.run(stage, script, host).await?;
                    }
                }
                Step::Drain => {
                    self.maintenance.check_cluster_safety(host).await?;
                    let result = self.drain.drain_with_retries(host).await?;
                    migrated = result
                        .jobs
                        .iter()
                        .filter(|j| j.outcome() == Outcome::Migrated)
                        .count();
                }
                Step::EnterMaintenance => self.enter_maintenance(host).await?,
                Step::BondCheck => self.check_bonds(host).await?,
                Step::Reboot { action } => self.reboot(host, action).await?,
                Step::WaitForReconnect => {
                    if options.reboot.needs_operator() {
                        progress(2, format!("{} is halted; power it on to continue", host.name));
                    }
                    self.wait_for_reconnect(host).await?;
                }
                Step::CancelMaintenance => {
                    self.maintenance.cancel_maintenance(host).await?;
                }
            }
        }
        Ok(migrated)
    }

    async fn enter_maintenance(&self, host: &Host) -> Result<()> {
        match self.maintenance.prepare_for_maintenance(host).await? {
            MaintenanceOutcome::Maintenance => Ok(()),
            MaintenanceOutcome::ErrorInMaintenance(reason) => {
                error!("{} did not reach maintenance: {}", host.name, reason);
                Err(DrainError::DrainStall {
                    host: host.name.clone(),
                    remaining: self.inventory.resident_count(host).await.unwrap_or_default(),
                })
            }
            MaintenanceOutcome::Enabled => Err(DrainError::MaintenanceCancelled {
                host: host.name.clone(),
            }),
        }
    }

    async fn check_bonds(&self, host: &Host) -> Result<()> {
        let Some(command) = host.hypervisor.bond_status_command() else {
            return Ok(());
        };
        let out = self
            .ctx
            .remote
            .run_command(&host.address, command)
            .await
            .map_err(|source| DrainError::Remote {
                host: host.name.clone(),
                source,
            })?;
        let degraded = degraded_bond_links(&out.stdout);
        if degraded.is_empty() {
            debug!("bonds on {} are healthy", host.name);
            return Ok(());
        }
        Err(DrainError::BondDegraded {
            host: host.name.clone(),
            detail: degraded.join("; "),
        })
    }

    /// Issue the reboot action and wait, bounded, for the host to drop off
    /// the network. A host that never goes down is put back into service.
    async fn reboot(&self, host: &Host, action: RebootAction) -> Result<()> {
        let Some(command) = host.hypervisor.action_command(action) else {
            return Ok(());
        };
        progress(2, format!("{} {}", Step::Reboot { action }, host.name));
        match self.ctx.remote.run_command(&host.address, command).await {
            Ok(out) if !out.success() => {
                return self
                    .rollback(host, format!("`{}` exited with {}", command, out.exit_code))
                    .await;
            }
            Ok(_) => {}
            // The connection may be cut by the reboot itself.
            Err(err) => debug!("reboot command on {} returned: {:#}", host.name, err),
        }

        let remote = &self.ctx.remote;
        let address = host.address.as_str();
        let polls = self.ctx.options.shutdown_polls;
        let down = self
            .ctx
            .poller()
            .with_max_iterations(polls)
            .until(|| async move { Ok((!remote.is_reachable(address).await).then_some(())) })
            .await
            .map_err(|source| DrainError::Remote {
                host: host.name.clone(),
                source,
            })?;
        match down {
            PollOutcome::Ready(()) => {
                progress(2, format!("{} went down", host.name));
                Ok(())
            }
            PollOutcome::Exhausted => {
                self.rollback(host, format!("still reachable after {polls} polls"))
                    .await
            }
            PollOutcome::Cancelled => Err(DrainError::Interrupted {
                next_host: host.name.clone(),
            }),
        }
    }

    async fn rollback(&self, host: &Host, reason: String) -> Result<()> {
        error!("reboot of {} failed ({}), rolling it back to Enabled", host.name, reason);
        if let Err(err) = self.maintenance.cancel_maintenance(host).await {
            error!("rollback of {} failed: {}", host.name, err);
        }
        Err(DrainError::RebootFailure {
            host: host.name.clone(),
            reason,
        })
    }

    /// Wait for SSH to answer and the hypervisor stack to come back. No upper
    /// bound; a halted host waits for its operator.
    async fn wait_for_reconnect(&self, host: &Host) -> Result<()> {
        let remote = &self.ctx.remote;
        let address = host.address.as_str();
        let liveness = host.hypervisor.liveness_command();
        let back = self
            .ctx
            .poller()
            .until(|| async move {
                if !remote.is_reachable(address).await {
                    return Ok(None);
                }
                match remote.run_command(address, liveness).await {
                    Ok(out) if out.success() => Ok(Some(())),
                    Ok(_) | Err(_) => Ok(None),
                }
            })
            .await
            .map_err(|source| DrainError::Remote {
                host: host.name.clone(),
                source,
            })?;
        match back {
            PollOutcome::Ready(()) => {
                progress(2, format!("{} is back", host.name));
                Ok(())
            }
            PollOutcome::Exhausted | PollOutcome::Cancelled => Err(DrainError::Interrupted {
                next_host: host.name.clone(),
            }),
        }
    }

    async fn set_managed_state(&self, cluster: &Cluster, state: ManagedState) -> Result<()> {
        progress(2, format!("setting {} to {}", cluster.name, state));
        let control = &self.ctx.control;
        with_retries(&self.ctx, "updateCluster", || {
            control.set_cluster_managed_state(&cluster.id, state)
        })
        .await
        .map_err(DrainError::api("updateCluster"))
    }

    async fn set_allocation_state(&self, cluster: &Cluster, state: AllocationState) -> Result<()> {
        progress(1, format!("setting allocation of {} to {}", cluster.name, state));
        let control = &self.ctx.control;
        with_retries(&self.ctx, "updateCluster", || {
            control.set_cluster_allocation_state(&cluster.id, state)
        })
        .await
        .map_err(DrainError::api("updateCluster"))
    }

    async fn restore_allocation(&self, cluster: &Cluster) {
        if let Err(err) = self.set_allocation_state(cluster, AllocationState::Enabled).await {
            error!("could not re-enable allocation on {}: {}", cluster.name, err);
            notify_quietly(
                self.ctx.notifier.as_ref(),
                &format!(
                    "Allocation on {} is still disabled ({err}). Please investigate manually.",
                    cluster.name
                ),
                Severity::Warning,
            )
            .await;
        }
    }

    /// Turn pool HA off for the run. Returns the heartbeat SR to re-enable it
    /// with, or `None` when HA was off or the hypervisor has none.
    async fn disable_ha(&self, cluster: &Cluster, hosts: &[Host], poolmaster: Option<&str>) -> Result<Option<String>> {
        let (Some(helper), Some(status), Some(disable)) = (
            cluster.hypervisor.ha_status_helper(),
            cluster.hypervisor.ha_status_command(),
            cluster.hypervisor.ha_disable_command(),
        ) else {
            return Ok(None);
        };
        let Some(target) = ha_target(hosts, poolmaster) else {
            return Ok(None);
        };
        let remote_err = |source| DrainError::Remote {
            host: target.name.clone(),
            source,
        };

        self.ctx
            .remote
            .upload(&target.address, HA_STATUS_HELPER, helper.as_bytes())
            .await
            .map_err(remote_err)?;
        let out = self
            .ctx
            .remote
            .run_command(&target.address, &status)
            .await
            .map_err(remote_err)?;
        let sr = out.stdout.trim().to_string();
        if sr.is_empty() {
            debug!("pool HA is off on {}", cluster.name);
            return Ok(None);
        }

        progress(1, format!("disabling pool HA on {}", cluster.name));
        let out = self
            .ctx
            .remote
            .run_command(&target.address, disable)
            .await
            .map_err(remote_err)?;
        if !out.success() {
            return Err(remote_err(anyhow::anyhow!(
                "`{}` exited with {}",
                disable,
                out.exit_code
            )));
        }
        Ok(Some(sr))
    }

    async fn enable_ha(&self, cluster: &Cluster, hosts: &[Host], poolmaster: Option<&str>, sr: &str) {
        let (Some(command), Some(target)) = (
            cluster.hypervisor.ha_enable_command(sr),
            ha_target(hosts, poolmaster),
        ) else {
            return;
        };
        progress(1, format!("re-enabling pool HA on {}", cluster.name));
        let enabled = match self.ctx.remote.run_command(&target.address, &command).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(anyhow::anyhow!("exited with {}", out.exit_code)),
            Err(err) => Err(err),
        };
        if let Err(err) = enabled {
            error!("could not re-enable HA on {}: {:#}", cluster.name, err);
            notify_quietly(
                self.ctx.notifier.as_ref(),
                &format!(
                    "Pool HA on {} is still disabled ({err:#}). Please investigate manually.",
                    cluster.name
                ),
                Severity::Warning,
            )
            .await;
        }
    }
}

/// Hosts already in a maintenance state go first so a resumed run finishes
/// them before touching another host, then the poolmaster, then the rest in
/// control plane order.
fn order_hosts(mut hosts: Vec<Host>, poolmaster: Option<&str>) -> Vec<Host> {
    hosts.sort_by_key(|h| {
        (
            !h.resource_state.in_maintenance(),
            poolmaster != Some(h.name.as_str()),
        )
    });
    hosts
}

fn ha_target<'a>(hosts: &'a [Host], poolmaster: Option<&str>) -> Option<&'a Host> {
    hosts
        .iter()
        .find(|h| Some(h.name.as_str()) == poolmaster)
        .or_else(|| hosts.iter().find(|h| h.connection_state.accepts_workloads()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fake::{self, Call, FakeCloud, FakeNotifier, FakeRemote};
    use crate::model::{HostTransition, Hypervisor, RedundantState, ResourceState};

    fn controller(cloud: &Arc<FakeCloud>, remote: &Arc<FakeRemote>) -> ClusterRollingController {
        ClusterRollingController::new(fake::context(cloud, remote))
    }

    fn three_hosts(hypervisor: Hypervisor) -> (Vec<Host>, Arc<FakeCloud>) {
        let mut hosts = vec![
            fake::host("a", 32, 6),
            fake::host("b", 32, 2),
            fake::host("c", 32, 0),
        ];
        for h in hosts.iter_mut() {
            h.hypervisor = hypervisor;
        }
        let workloads = vec![
            fake::vm("web1", &hosts[0], 4),
            fake::vm("web2", &hosts[0], 2),
            fake::vm("db1", &hosts[1], 2),
        ];
        let cloud = FakeCloud::new(fake::cluster(hypervisor), hosts.clone(), workloads);
        (hosts, cloud)
    }

    fn state_changes(cloud: &FakeCloud) -> Vec<(String, HostTransition)> {
        cloud
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SetHostState(host, t) => Some((host, t)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_roll_reboots_every_host_once() -> anyhow::Result<()> {
        let (hosts, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();

        let summary = controller(&cloud, &remote).run("cluster1", &RollingOptions::default()).await?;
        assert!(summary.succeeded());
        assert!(summary.hosts.iter().all(|h| h.outcome == HostOutcome::Done));

        for host in &hosts {
            assert_eq!(ResourceState::Enabled, cloud.host(&host.name).resource_state);
            let reboots = remote
                .commands()
                .iter()
                .filter(|(addr, cmd)| addr == &host.address && cmd.contains("shutdown -r"))
                .count();
            assert_eq!(1, reboots, "{}", host.name);
        }
        assert_eq!(6, state_changes(&cloud).len());
        assert_eq!(3, cloud.with(|s| s.workloads.len()));
        Ok(())
    }

    #[tokio::test]
    async fn test_only_one_host_is_ever_in_maintenance() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        controller(&cloud, &remote).run("cluster1", &RollingOptions::default()).await?;

        let mut in_maintenance = std::collections::BTreeSet::new();
        for (host, transition) in state_changes(&cloud) {
            match transition {
                HostTransition::PrepareForMaintenance => {
                    assert!(in_maintenance.is_empty(), "{host} entered while {in_maintenance:?}");
                    in_maintenance.insert(host);
                }
                HostTransition::CancelMaintenance => {
                    in_maintenance.remove(&host);
                }
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_redundant_routers_stay_apart() -> anyhow::Result<()> {
        let hosts = vec![
            fake::host("a", 32, 1),
            fake::host("b", 32, 1),
            fake::host("c", 32, 0),
        ];
        let workloads = vec![
            fake::router("r1", &hosts[0], "net-1", RedundantState::Master),
            fake::router("r2", &hosts[1], "net-1", RedundantState::Backup),
        ];
        let cloud = FakeCloud::new(fake::cluster(Hypervisor::Kvm), hosts, workloads);
        let remote = FakeRemote::new();

        controller(&cloud, &remote).run("cluster1", &RollingOptions::default()).await?;
        let r1 = cloud.workload("r1");
        let r2 = cloud.workload("r2");
        assert!(r1.host_id.is_some());
        assert_ne!(r1.host_id, r2.host_id);
        Ok(())
    }

    #[tokio::test]
    async fn test_drain_failure_halts_before_reboot() {
        let a = fake::host("a", 32, 10);
        let cloud = FakeCloud::new(
            fake::cluster(Hypervisor::Kvm),
            vec![a.clone(), fake::host("b", 16, 8)],
            vec![fake::vm("huge", &a, 10)],
        );
        let remote = FakeRemote::new();

        let err = controller(&cloud, &remote)
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::CapacityExhausted { .. }));
        assert!(err.investigate_message().contains("investigate manually"));
        assert!(!remote.ran("shutdown"));
        assert!(state_changes(&cloud).is_empty());
    }

    #[tokio::test]
    async fn test_host_in_maintenance_is_resumed_without_draining() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        cloud.with(|s| {
            s.workloads.retain(|w| w.name == "db1");
            s.hosts[0].memory_allocated = 0;
        });
        cloud.set_host_state("host-c", ResourceState::Maintenance);
        let remote = FakeRemote::new();

        let summary = controller(&cloud, &remote).run("cluster1", &RollingOptions::default()).await?;
        assert_eq!("host-c", summary.hosts[0].host);
        let changes = state_changes(&cloud);
        assert_eq!(("id-c".to_string(), HostTransition::CancelMaintenance), changes[0]);
        assert!(!changes.contains(&("id-c".to_string(), HostTransition::PrepareForMaintenance)));
        Ok(())
    }

    #[tokio::test]
    async fn test_refuses_cluster_with_two_hosts_in_maintenance() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        cloud.set_host_state("host-b", ResourceState::Maintenance);
        cloud.set_host_state("host-c", ResourceState::PrepareForMaintenance);

        let err = controller(&cloud, &FakeRemote::new())
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::UnsafeClusterState { .. }));
        assert!(cloud.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_poolmaster_goes_first_and_managed_state_is_restored() {
        let (_, cloud) = three_hosts(Hypervisor::XenServer);
        cloud.with(|s| {
            s.workloads.clear();
            s.workloads.push(fake::vm("huge", &s.hosts[1], 40));
        });
        let remote = FakeRemote::new();
        remote.reply("pool-list params=master", 0, "uuid-b");
        remote.reply("host-param-get uuid=uuid-b", 0, "host-b");

        let err = controller(&cloud, &remote)
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::CapacityExhausted { ref workload, .. } if workload == "huge"));
        assert!(state_changes(&cloud).is_empty());
        let managed: Vec<Call> = cloud
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetManaged(_)))
            .collect();
        assert_eq!(
            vec![
                Call::SetManaged(ManagedState::Unmanaged),
                Call::SetManaged(ManagedState::Managed)
            ],
            managed
        );
        assert_eq!(ManagedState::Managed, cloud.with(|s| s.clusters[0].managed_state));
    }

    #[tokio::test]
    async fn test_allocation_is_disabled_for_the_run_and_restored_on_failure() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        cloud.with(|s| s.workloads.push(fake::vm("huge", &s.hosts[2], 40)));
        let options = RollingOptions {
            disable_allocation: true,
            ..Default::default()
        };

        let err = controller(&cloud, &FakeRemote::new())
            .run("cluster1", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::CapacityExhausted { .. }));
        let allocation: Vec<Call> = cloud
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SetAllocation(_)))
            .collect();
        assert_eq!(
            vec![
                Call::SetAllocation(AllocationState::Disabled),
                Call::SetAllocation(AllocationState::Enabled)
            ],
            allocation
        );
        assert_eq!(AllocationState::Enabled, cloud.with(|s| s.clusters[0].allocation_state));

        cloud.with(|s| {
            s.calls.clear();
            s.clusters[0].allocation_state = AllocationState::Disabled;
        });
        let _ = controller(&cloud, &FakeRemote::new()).run("cluster1", &options).await;
        assert!(!cloud.calls().iter().any(|c| matches!(c, Call::SetAllocation(_))));
        assert_eq!(AllocationState::Disabled, cloud.with(|s| s.clusters[0].allocation_state));
    }

    #[tokio::test]
    async fn test_pool_ha_is_disabled_for_the_run() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::XenServer);
        let remote = FakeRemote::new();
        remote.reply(HA_STATUS_HELPER, 0, "sr-1234\n");

        controller(&cloud, &remote).run("cluster1", &RollingOptions::default()).await?;
        let uploads = remote.uploads.lock().unwrap().clone();
        assert_eq!(1, uploads.len());
        assert_eq!(HA_STATUS_HELPER, uploads[0].1);
        assert!(uploads[0].2.contains("ha-statefiles"));
        let commands: Vec<String> = remote.commands().into_iter().map(|(_, c)| c).collect();
        let disabled = commands.iter().position(|c| c == "xe pool-ha-disable");
        let enabled = commands
            .iter()
            .position(|c| c == "xe pool-ha-enable heartbeat-sr-uuids=sr-1234");
        assert!(disabled.is_some() && enabled.is_some());
        assert!(disabled < enabled);
        Ok(())
    }

    #[tokio::test]
    async fn test_reboot_that_never_goes_down_is_rolled_back() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        remote
            .reboot_down_polls
            .store(0, std::sync::atomic::Ordering::SeqCst);

        let err = controller(&cloud, &remote)
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::RebootFailure { ref host, .. } if host == "host-a"));
        assert_eq!(ResourceState::Enabled, cloud.host("host-a").resource_state);
        assert!(!remote.commands().iter().any(|(addr, cmd)| {
            addr == &cloud.host("host-b").address && cmd.contains("shutdown")
        }));
    }

    #[tokio::test]
    async fn test_degraded_bond_halts_the_run() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        remote.reply("/proc/net/bonding", 0, "Slave Interface: eth1\nMII Status: down\n");

        let err = controller(&cloud, &remote)
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::BondDegraded { .. }));
        assert!(!remote.ran("shutdown"));

        let skip_check = RollingOptions {
            bond_check: false,
            ..Default::default()
        };
        cloud.set_host_state("host-a", ResourceState::Maintenance);
        let summary = controller(&cloud, &remote).run("cluster1", &skip_check).await;
        assert!(summary.is_ok());
    }

    #[tokio::test]
    async fn test_ignored_hosts_are_left_alone() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        let options = RollingOptions {
            ignore_hosts: vec!["host-b".into()],
            ..Default::default()
        };

        let summary = controller(&cloud, &remote).run("cluster1", &options).await?;
        assert_eq!(HostOutcome::Ignored, summary.hosts[1].outcome);
        assert!(!state_changes(&cloud).iter().any(|(h, _)| h == "id-b"));
        assert!(cloud.resident_on("host-b").contains(&"db1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupt_stops_at_next_host() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        let ctx = fake::context(&cloud, &remote);
        ctx.interrupts.request();

        let err = ClusterRollingController::new(ctx)
            .run("cluster1", &RollingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DrainError::Interrupted { ref next_host } if next_host == "host-b"));
        assert_eq!(ResourceState::Enabled, cloud.host("host-a").resource_state);
        assert_eq!(2, state_changes(&cloud).len());
    }

    #[tokio::test]
    async fn test_repeated_interrupt_cancels_wait_for_reconnect() {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        remote
            .never_returns
            .lock()
            .unwrap()
            .insert(cloud.host("host-a").address);
        let ctx = fake::context(&cloud, &remote);

        let interrupts = ctx.interrupts.clone();
        let rebooted = remote.clone();
        tokio::spawn(async move {
            while !rebooted.ran("shutdown -r") {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            interrupts.request();
            interrupts.request();
        });

        let controller = ClusterRollingController::new(ctx);
        let options = RollingOptions::default();
        let run = controller.run("cluster1", &options);
        let err = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("run should stop once cancelled")
            .unwrap_err();
        assert!(matches!(err, DrainError::Interrupted { ref next_host } if next_host == "host-a"));
        assert_eq!(ResourceState::Maintenance, cloud.host("host-a").resource_state);
        assert_eq!(1, state_changes(&cloud).len());
    }

    #[tokio::test]
    async fn test_summary_is_sent_even_when_notifications_fail() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        let notifier = Arc::new(FakeNotifier::default());
        let ctx = DrainContext::new(cloud.clone(), remote.clone(), notifier.clone(), fake::options());
        ClusterRollingController::new(ctx)
            .run("cluster1", &RollingOptions::default())
            .await?;
        let messages = notifier.messages();
        assert!(messages.first().map_or(false, |m| m.starts_with("Starting rolling reboot")));
        assert!(messages.last().map_or(false, |m| m.starts_with("Finished rolling reboot")));
        assert!(messages.last().map_or(false, |m| m.contains("** host-a: done")));

        let ctx = DrainContext::new(
            cloud.clone(),
            remote,
            Arc::new(FakeNotifier::failing()),
            fake::options(),
        );
        let summary = ClusterRollingController::new(ctx)
            .run("cluster1", &RollingOptions::default())
            .await?;
        assert!(summary.succeeded());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_resolves_hooks_without_running_them() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        let mut options = fake::options();
        options.dry_run = true;
        let controller = ClusterRollingController::new(fake::context_with(&cloud, &remote, options));

        let failing = RollingOptions {
            hooks: Hooks::new(Some("sh -c 'exit 3'".into()), None, None),
            ..Default::default()
        };
        let summary = controller.run("cluster1", &failing).await?;
        assert!(summary.hosts.iter().all(|h| h.outcome == HostOutcome::Planned));

        let missing = RollingOptions {
            hooks: Hooks::new(None, None, Some("no-such-hvdrain-hook".into())),
            ..Default::default()
        };
        let err = controller.run("cluster1", &missing).await.unwrap_err();
        assert!(matches!(err, DrainError::HookFailed { stage: "post-reboot", .. }));
        assert!(cloud.mutations().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_roll_is_read_only() -> anyhow::Result<()> {
        let (_, cloud) = three_hosts(Hypervisor::Kvm);
        let remote = FakeRemote::new();
        let mut options = fake::options();
        options.dry_run = true;
        let ctx = fake::context_with(&cloud, &remote, options);

        let summary = ClusterRollingController::new(ctx)
            .run("cluster1", &RollingOptions::default())
            .await?;
        assert!(summary.dry_run);
        assert!(summary.hosts.iter().all(|h| h.outcome == HostOutcome::Planned));
        assert!(cloud.mutations().is_empty());
        assert!(!remote.ran("shutdown"));
        Ok(())
    }
}
