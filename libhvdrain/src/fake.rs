//! In-memory stand-ins for the control plane, the hypervisors and the
//! notification sinks. Every call is recorded so tests can assert on what was
//! (and was not) mutated.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::{DrainContext, RunOptions};
use crate::control::ControlPlane;
use crate::error::TransientApiFailure;
use crate::executor::{CommandOutput, RemoteExecutor};
use crate::model::*;
use crate::notify::{Notifier, Severity};

pub fn host(name: &str, total_gib: u64, allocated_gib: u64) -> Host {
    Host {
        id: format!("id-{name}"),
        name: format!("host-{name}"),
        address: format!("10.0.0.{}", name.bytes().map(u32::from).sum::<u32>() % 250),
        cluster_id: "cluster-1".into(),
        cluster_name: "cluster1".into(),
        pod_id: "pod-1".into(),
        hypervisor: Hypervisor::Kvm,
        resource_state: ResourceState::Enabled,
        connection_state: ConnectionState::Up,
        memory_total: total_gib * GIB,
        memory_allocated: allocated_gib * GIB,
        host_tags: BTreeSet::new(),
        suitable_for_migration: true,
        dedication_group: None,
    }
}

pub fn vm(name: &str, on: &Host, memory_gib: u64) -> Workload {
    Workload {
        id: format!("vm-{name}"),
        name: name.into(),
        instance_name: format!("i-2-{name}-VM"),
        kind: WorkloadKind::Instance,
        state: WorkloadState::Running,
        memory: memory_gib * GIB,
        required_tags: BTreeSet::new(),
        host_id: Some(on.id.clone()),
        host_name: Some(on.name.clone()),
        project: false,
        iso_attached: false,
        dedication_group: None,
        local_storage: false,
        redundancy_group: None,
        is_redundant_router: false,
        redundant_state: RedundantState::Unknown,
        maintenance_policy: MaintenancePolicy::Normal,
    }
}

pub fn router(name: &str, on: &Host, group: &str, state: RedundantState) -> Workload {
    Workload {
        id: format!("r-{name}"),
        kind: WorkloadKind::Router,
        instance_name: format!("r-{name}-VM"),
        redundancy_group: Some(group.into()),
        is_redundant_router: true,
        redundant_state: state,
        ..vm(name, on, 1)
    }
}

pub fn cluster(hypervisor: Hypervisor) -> Cluster {
    Cluster {
        id: "cluster-1".into(),
        name: "cluster1".into(),
        pod_id: "pod-1".into(),
        zone_id: "zone-1".into(),
        hypervisor,
        allocation_state: AllocationState::Enabled,
        managed_state: ManagedState::Managed,
    }
}

/// Options with millisecond intervals and small stall limits.
pub fn options() -> RunOptions {
    RunOptions {
        dry_run: false,
        poll_interval: Duration::from_millis(1),
        drain_backoff: Duration::from_millis(1),
        call_timeout: Duration::from_secs(5),
        stall_polls: 5,
        shutdown_polls: 10,
        ..Default::default()
    }
}

pub fn context(cloud: &Arc<FakeCloud>, remote: &Arc<FakeRemote>) -> DrainContext {
    context_with(cloud, remote, options())
}

pub fn context_with(
    cloud: &Arc<FakeCloud>,
    remote: &Arc<FakeRemote>,
    options: RunOptions,
) -> DrainContext {
    DrainContext::new(
        cloud.clone(),
        remote.clone(),
        Arc::new(FakeNotifier::default()),
        options,
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListClusters,
    ListHosts,
    ListWorkloads,
    FindCandidates(String),
    SetHostState(String, HostTransition),
    Migrate {
        workload: String,
        dest: String,
        with_volume: bool,
    },
    PollJob,
    SetManaged(ManagedState),
    SetAllocation(AllocationState),
    Start(String, String),
    Stop(String),
    DetachIso(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Call::ListClusters
                | Call::ListHosts
                | Call::ListWorkloads
                | Call::FindCandidates(_)
                | Call::PollJob
        )
    }
}

/// How the fake answers a PrepareForMaintenance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaintenanceBehavior {
    /// Maintenance once nothing is resident, PrepareForMaintenance until then.
    #[default]
    WhenEmpty,
    ErrorInMaintenance,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub clusters: Vec<Cluster>,
    pub hosts: Vec<Host>,
    pub workloads: Vec<Workload>,
    pub calls: Vec<Call>,
    /// Migrate calls that fail with a transient error before one succeeds.
    pub transient_migrate_failures: u32,
    /// Migrate calls to these workload ids fail permanently.
    pub broken_migrations: BTreeSet<String>,
    pub detach_fails: bool,
    pub maintenance: MaintenanceBehavior,
    /// Host ids that never leave PrepareForMaintenance.
    pub stuck_in_prepare: BTreeSet<String>,
    /// listHosts calls, counted from 1, that fail with a transient error.
    pub flaky_list_hosts: BTreeSet<usize>,
}

#[derive(Debug, Default)]
pub struct FakeCloud {
    pub state: Mutex<FakeState>,
}

impl FakeCloud {
    pub fn new(cluster: Cluster, hosts: Vec<Host>, workloads: Vec<Workload>) -> Arc<Self> {
        let cloud = Self::default();
        {
            let mut state = cloud.state.lock().unwrap();
            state.clusters.push(cluster);
            state.hosts = hosts;
            state.workloads = workloads;
        }
        Arc::new(cloud)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn host(&self, name: &str) -> Host {
        self.with(|s| s.hosts.iter().find(|h| h.name == name).cloned())
            .unwrap_or_else(|| panic!("no host {name}"))
    }

    pub fn workload(&self, name: &str) -> Workload {
        self.with(|s| s.workloads.iter().find(|w| w.name == name).cloned())
            .unwrap_or_else(|| panic!("no workload {name}"))
    }

    pub fn resident_on(&self, host_name: &str) -> Vec<String> {
        let host = self.host(host_name);
        self.with(|s| {
            s.workloads
                .iter()
                .filter(|w| w.resides_on(&host))
                .map(|w| w.name.clone())
                .collect()
        })
    }

    pub fn set_host_state(&self, host_name: &str, state: ResourceState) {
        self.with(|s| {
            if let Some(h) = s.hosts.iter_mut().find(|h| h.name == host_name) {
                h.resource_state = state;
            }
        })
    }
}

impl FakeState {
    fn record(&mut self, call: Call) {
        self.calls.push(call);
    }

    fn resident_count(&self, host_id: &str) -> usize {
        self.workloads
            .iter()
            .filter(|w| w.host_id.as_deref() == Some(host_id))
            .count()
    }

    fn move_workload(&mut self, workload_id: &str, dest_id: Option<&str>) {
        let Some(idx) = self.workloads.iter().position(|w| w.id == workload_id) else {
            return;
        };
        let memory = self.workloads[idx].memory;
        if let Some(old) = self.workloads[idx].host_id.clone() {
            if let Some(h) = self.hosts.iter_mut().find(|h| h.id == old) {
                h.memory_allocated = h.memory_allocated.saturating_sub(memory);
            }
        }
        let dest = dest_id.and_then(|id| self.hosts.iter_mut().find(|h| h.id == id));
        let (host_id, host_name) = match dest {
            Some(h) => {
                h.memory_allocated += memory;
                (Some(h.id.clone()), Some(h.name.clone()))
            }
            None => (None, None),
        };
        let w = &mut self.workloads[idx];
        w.host_id = host_id;
        w.host_name = host_name;
    }

    fn settle_maintenance(&mut self) {
        let counts: HashMap<String, usize> = self
            .hosts
            .iter()
            .map(|h| (h.id.clone(), self.resident_count(&h.id)))
            .collect();
        for h in self.hosts.iter_mut() {
            if h.resource_state == ResourceState::PrepareForMaintenance
                && !self.stuck_in_prepare.contains(&h.id)
                && counts.get(&h.id).copied().unwrap_or(0) == 0
            {
                h.resource_state = ResourceState::Maintenance;
            }
        }
    }
}

#[async_trait]
impl ControlPlane for FakeCloud {
    async fn list_clusters(&self, name: Option<&str>) -> Result<Vec<Cluster>> {
        Ok(self.with(|s| {
            s.record(Call::ListClusters);
            s.clusters
                .iter()
                .filter(|c| name.map_or(true, |n| c.name == n))
                .cloned()
                .collect()
        }))
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>> {
        self.with(|s| {
            s.record(Call::ListHosts);
            let nth = s.calls.iter().filter(|c| **c == Call::ListHosts).count();
            if s.flaky_list_hosts.contains(&nth) {
                return Err(anyhow::Error::new(TransientApiFailure(
                    "listHosts timed out".into(),
                )));
            }
            s.settle_maintenance();
            Ok(s.hosts
                .iter()
                .filter(|h| filter.id.as_ref().map_or(true, |id| &h.id == id))
                .filter(|h| filter.name.as_ref().map_or(true, |n| &h.name == n))
                .filter(|h| filter.cluster_id.as_ref().map_or(true, |c| &h.cluster_id == c))
                .cloned()
                .collect())
        })
    }

    async fn list_workloads(&self, filter: &WorkloadFilter) -> Result<Vec<Workload>> {
        Ok(self.with(|s| {
            s.record(Call::ListWorkloads);
            s.workloads
                .iter()
                .filter(|w| w.kind == filter.kind && w.project == filter.project)
                .filter(|w| filter.id.as_ref().map_or(true, |id| &w.id == id))
                .filter(|w| filter.host_id.is_none() || w.host_id == filter.host_id)
                .filter(|w| {
                    filter.redundancy_group.is_none()
                        || w.redundancy_group == filter.redundancy_group
                })
                .cloned()
                .collect()
        }))
    }

    async fn find_migration_candidates(&self, workload: &Workload) -> Result<Vec<MigrationCandidate>> {
        Ok(self.with(|s| {
            s.record(Call::FindCandidates(workload.name.clone()));
            s.hosts
                .iter()
                .filter(|h| workload.host_id.as_deref() != Some(h.id.as_str()))
                .map(|h| MigrationCandidate {
                    host: h.clone(),
                    requires_storage_motion: workload.local_storage,
                    suitable: h.suitable_for_migration
                        && h.is_up_and_enabled()
                        && h.available_memory() >= workload.memory,
                })
                .collect()
        }))
    }

    async fn set_host_resource_state(&self, host_id: &str, target: HostTransition) -> Result<JobId> {
        self.with(|s| {
            s.record(Call::SetHostState(host_id.into(), target));
            let behavior = s.maintenance;
            let stuck = s.stuck_in_prepare.contains(host_id);
            let empty = s.resident_count(host_id) == 0;
            let host = s
                .hosts
                .iter_mut()
                .find(|h| h.id == host_id)
                .ok_or_else(|| anyhow::anyhow!("no host {host_id}"))?;
            host.resource_state = match (target, behavior) {
                (HostTransition::CancelMaintenance, _) => ResourceState::Enabled,
                (HostTransition::PrepareForMaintenance, MaintenanceBehavior::ErrorInMaintenance) => {
                    ResourceState::ErrorInMaintenance
                }
                (HostTransition::PrepareForMaintenance, _) if empty && !stuck => {
                    ResourceState::Maintenance
                }
                (HostTransition::PrepareForMaintenance, _) => ResourceState::PrepareForMaintenance,
            };
            Ok(JobId(format!("job-state-{host_id}")))
        })
    }

    async fn migrate_workload(
        &self,
        workload: &Workload,
        dest_host_id: &str,
        with_volume: bool,
    ) -> Result<JobId> {
        self.with(|s| {
            s.record(Call::Migrate {
                workload: workload.name.clone(),
                dest: dest_host_id.into(),
                with_volume,
            });
            if s.transient_migrate_failures > 0 {
                s.transient_migrate_failures -= 1;
                return Err(anyhow::Error::new(TransientApiFailure(
                    "request timed out".into(),
                )));
            }
            if s.broken_migrations.contains(&workload.id) {
                anyhow::bail!("migration of {} refused", workload.name);
            }
            s.move_workload(&workload.id, Some(dest_host_id));
            Ok(JobId(format!("job-migrate-{}", workload.id)))
        })
    }

    async fn poll_job(&self, _job: &JobId) -> Result<AsyncJobStatus> {
        self.with(|s| s.record(Call::PollJob));
        Ok(AsyncJobStatus::Succeeded)
    }

    async fn set_cluster_managed_state(&self, cluster_id: &str, state: ManagedState) -> Result<()> {
        self.with(|s| {
            s.record(Call::SetManaged(state));
            for c in s.clusters.iter_mut().filter(|c| c.id == cluster_id) {
                c.managed_state = state;
            }
        });
        Ok(())
    }

    async fn set_cluster_allocation_state(
        &self,
        cluster_id: &str,
        state: AllocationState,
    ) -> Result<()> {
        self.with(|s| {
            s.record(Call::SetAllocation(state));
            for c in s.clusters.iter_mut().filter(|c| c.id == cluster_id) {
                c.allocation_state = state;
            }
        });
        Ok(())
    }

    async fn start_workload(&self, workload: &Workload, host_id: &str) -> Result<JobId> {
        self.with(|s| {
            s.record(Call::Start(workload.name.clone(), host_id.into()));
            s.move_workload(&workload.id, Some(host_id));
            if let Some(w) = s.workloads.iter_mut().find(|w| w.id == workload.id) {
                w.state = WorkloadState::Running;
            }
            Ok(JobId(format!("job-start-{}", workload.id)))
        })
    }

    async fn stop_workload(&self, workload: &Workload) -> Result<JobId> {
        self.with(|s| {
            s.record(Call::Stop(workload.name.clone()));
            s.move_workload(&workload.id, None);
            if let Some(w) = s.workloads.iter_mut().find(|w| w.id == workload.id) {
                w.state = WorkloadState::Stopped;
            }
            Ok(JobId(format!("job-stop-{}", workload.id)))
        })
    }

    async fn detach_removable_media(&self, workload: &Workload) -> Result<JobId> {
        self.with(|s| {
            s.record(Call::DetachIso(workload.name.clone()));
            if s.detach_fails {
                anyhow::bail!("iso is locked");
            }
            if let Some(w) = s.workloads.iter_mut().find(|w| w.id == workload.id) {
                w.iso_attached = false;
            }
            Ok(JobId(format!("job-detach-{}", workload.id)))
        })
    }
}

/// A hypervisor fleet that answers every command with exit 0 unless told
/// otherwise, and drops off the network for a few polls after a reboot.
#[derive(Debug, Default)]
pub struct FakeRemote {
    pub commands: Mutex<Vec<(String, String)>>,
    /// Canned replies keyed by a substring of the command.
    pub replies: Mutex<Vec<(String, CommandOutput)>>,
    down_polls: Mutex<HashMap<String, u32>>,
    pub reboot_down_polls: AtomicU32,
    pub never_returns: Mutex<BTreeSet<String>>,
    /// (address, path, contents) of every upload.
    pub uploads: Mutex<Vec<(String, String, String)>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.reboot_down_polls.store(2, Ordering::SeqCst);
        Arc::new(remote)
    }

    pub fn reply(&self, contains: &str, exit_code: u32, stdout: &str) {
        self.replies.lock().unwrap().push((
            contains.into(),
            CommandOutput {
                exit_code,
                stdout: stdout.into(),
            },
        ));
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, contains: &str) -> bool {
        self.commands().iter().any(|(_, c)| c.contains(contains))
    }
}

#[async_trait]
impl RemoteExecutor for FakeRemote {
    async fn run_command(&self, address: &str, command: &str) -> Result<CommandOutput> {
        self.commands
            .lock()
            .unwrap()
            .push((address.into(), command.into()));
        if command.contains("shutdown") || command.contains("sysrq") {
            let polls = self.reboot_down_polls.load(Ordering::SeqCst);
            self.down_polls.lock().unwrap().insert(address.into(), polls);
        }
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
            }))
    }

    async fn upload(&self, address: &str, path: &str, contents: &[u8]) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((address.into(), path.into(), String::from_utf8_lossy(contents).into_owned()));
        Ok(())
    }

    async fn is_reachable(&self, address: &str) -> bool {
        if self.never_returns.lock().unwrap().contains(address) {
            return false;
        }
        let mut down = self.down_polls.lock().unwrap();
        match down.get_mut(address) {
            Some(n) if *n > 0 => {
                *n -= 1;
                false
            }
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeNotifier {
    fail: bool,
    messages: Mutex<VecDeque<(String, Severity)>>,
}

impl FakeNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, message: &str, severity: Severity, _channel: Option<&str>) -> Result<()> {
        if self.fail {
            anyhow::bail!("webhook unreachable");
        }
        self.messages
            .lock()
            .unwrap()
            .push_back((message.into(), severity));
        Ok(())
    }
}
