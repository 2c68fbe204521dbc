//! Typed records for the things the control plane reports: clusters, hosts
//! and the workloads resident on them. Control plane clients deserialize
//! into these at their boundary; the core never sees raw API responses.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub type Bytes = u64;

pub const GIB: Bytes = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hypervisor {
    XenServer,
    #[serde(rename = "KVM")]
    Kvm,
    VMware,
}

impl Hypervisor {
    /// Whether the hypervisor pools hosts under a designated master that has
    /// to be handled first during a rolling operation.
    pub fn has_poolmaster(&self) -> bool {
        matches!(self, Hypervisor::XenServer)
    }
}

impl FromStr for Hypervisor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xenserver" | "xen" => Ok(Hypervisor::XenServer),
            "kvm" => Ok(Hypervisor::Kvm),
            "vmware" => Ok(Hypervisor::VMware),
            other => Err(format!("unknown hypervisor: {other}")),
        }
    }
}

impl fmt::Display for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hypervisor::XenServer => write!(f, "XenServer"),
            Hypervisor::Kvm => write!(f, "KVM"),
            Hypervisor::VMware => write!(f, "VMware"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Enabled,
    Disabled,
    PrepareForMaintenance,
    Maintenance,
    ErrorInMaintenance,
    Error,
}

impl ResourceState {
    /// States that count against the one-host-in-maintenance rule.
    pub fn in_maintenance(&self) -> bool {
        matches!(
            self,
            ResourceState::PrepareForMaintenance
                | ResourceState::Maintenance
                | ResourceState::ErrorInMaintenance
        )
    }

    pub fn accepts_workloads(&self) -> bool {
        matches!(self, ResourceState::Enabled)
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Enabled" => Ok(ResourceState::Enabled),
            "Disabled" => Ok(ResourceState::Disabled),
            "PrepareForMaintenance" => Ok(ResourceState::PrepareForMaintenance),
            "Maintenance" => Ok(ResourceState::Maintenance),
            "ErrorInMaintenance" => Ok(ResourceState::ErrorInMaintenance),
            "Error" => Ok(ResourceState::Error),
            other => Err(format!("unknown resource state: {other}")),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Up,
    Down,
    Alert,
    Disconnected,
    Connecting,
    #[serde(other)]
    Unknown,
}

impl ConnectionState {
    pub fn accepts_workloads(&self) -> bool {
        matches!(self, ConnectionState::Up)
    }
}

impl From<&str> for ConnectionState {
    fn from(s: &str) -> Self {
        match s {
            "Up" => ConnectionState::Up,
            "Down" => ConnectionState::Down,
            "Alert" => ConnectionState::Alert,
            "Disconnected" => ConnectionState::Disconnected,
            "Connecting" => ConnectionState::Connecting,
            _ => ConnectionState::Unknown,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedState {
    Managed,
    Unmanaged,
}

impl fmt::Display for ManagedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub pod_id: String,
    pub zone_id: String,
    pub hypervisor: Hypervisor,
    pub allocation_state: AllocationState,
    pub managed_state: ManagedState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub pod_id: String,
    pub hypervisor: Hypervisor,
    pub resource_state: ResourceState,
    pub connection_state: ConnectionState,
    pub memory_total: Bytes,
    pub memory_allocated: Bytes,
    pub host_tags: BTreeSet<String>,
    pub suitable_for_migration: bool,
    /// Affinity group the host is dedicated to, if any.
    pub dedication_group: Option<String>,
}

impl Host {
    pub fn available_memory(&self) -> Bytes {
        self.memory_total.saturating_sub(self.memory_allocated)
    }

    pub fn has_tags(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.host_tags)
    }

    pub fn is_up_and_enabled(&self) -> bool {
        self.resource_state == ResourceState::Enabled
            && self.connection_state == ConnectionState::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Instance,
    Router,
    SystemVm,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Instance => write!(f, "instance"),
            WorkloadKind::Router => write!(f, "router"),
            WorkloadKind::SystemVm => write!(f, "system vm"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Migrating,
    #[serde(other)]
    Unknown,
}

impl From<&str> for WorkloadState {
    fn from(s: &str) -> Self {
        match s {
            "Running" => WorkloadState::Running,
            "Stopped" => WorkloadState::Stopped,
            "Starting" => WorkloadState::Starting,
            "Stopping" => WorkloadState::Stopping,
            "Migrating" => WorkloadState::Migrating,
            _ => WorkloadState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedundantState {
    Master,
    Backup,
    Fault,
    Unknown,
}

impl From<&str> for RedundantState {
    fn from(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => RedundantState::Master,
            "BACKUP" => RedundantState::Backup,
            "FAULT" => RedundantState::Fault,
            _ => RedundantState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaintenancePolicy {
    #[default]
    Normal,
    ShutdownAndStart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    /// Name the hypervisor knows the workload by (`i-2-123-VM`).
    pub instance_name: String,
    pub kind: WorkloadKind,
    pub state: WorkloadState,
    pub memory: Bytes,
    pub required_tags: BTreeSet<String>,
    pub host_id: Option<String>,
    pub host_name: Option<String>,
    pub project: bool,
    pub iso_attached: bool,
    pub dedication_group: Option<String>,
    /// Disks live on host-local storage, so the disks have to move with it.
    pub local_storage: bool,
    /// Guest network or VPC a router serves; redundant peers share it.
    pub redundancy_group: Option<String>,
    pub is_redundant_router: bool,
    pub redundant_state: RedundantState,
    pub maintenance_policy: MaintenancePolicy,
}

impl Workload {
    pub fn is_running(&self) -> bool {
        self.state == WorkloadState::Running
    }

    pub fn resides_on(&self, host: &Host) -> bool {
        self.host_id.as_deref() == Some(host.id.as_str())
    }
}

/// A host as offered by the control plane's "find hosts for migration" call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCandidate {
    pub host: Host,
    pub requires_storage_motion: bool,
    pub suitable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFilter {
    pub id: Option<String>,
    pub name: Option<String>,
    pub cluster_id: Option<String>,
}

impl HostFilter {
    pub fn id<S: Into<String>>(id: S) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn name<S: Into<String>>(name: S) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn cluster<S: Into<String>>(cluster_id: S) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadFilter {
    pub kind: WorkloadKind,
    pub id: Option<String>,
    pub host_id: Option<String>,
    /// List project-owned workloads instead of account-owned ones.
    pub project: bool,
    pub redundancy_group: Option<String>,
}

impl WorkloadFilter {
    pub fn on_host<S: Into<String>>(kind: WorkloadKind, host_id: S, project: bool) -> Self {
        Self {
            kind,
            id: None,
            host_id: Some(host_id.into()),
            project,
            redundancy_group: None,
        }
    }

    pub fn redundancy_group<S: Into<String>>(group: S, project: bool) -> Self {
        Self {
            kind: WorkloadKind::Router,
            id: None,
            host_id: None,
            project,
            redundancy_group: Some(group.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of an asynchronous control plane job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncJobStatus {
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTransition {
    PrepareForMaintenance,
    CancelMaintenance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    Running,
    Succeeded,
    /// Stopped under a ShutdownAndStart policy, to be started again later.
    Held,
    /// Dry-run: a destination was found but nothing was moved.
    Planned,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Migrated,
    Skipped(String),
    Failed(String),
}

/// In-process record of one workload being moved off a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    pub workload_id: String,
    pub workload_name: String,
    pub kind: WorkloadKind,
    pub memory: Bytes,
    pub source: String,
    pub destination: Option<String>,
    pub status: MigrationStatus,
    pub retries: u32,
}

impl MigrationJob {
    pub fn new(workload: &Workload, source: &Host) -> Self {
        Self {
            workload_id: workload.id.clone(),
            workload_name: workload.name.clone(),
            kind: workload.kind,
            memory: workload.memory,
            source: source.name.clone(),
            destination: None,
            status: MigrationStatus::Pending,
            retries: 0,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match &self.status {
            MigrationStatus::Succeeded | MigrationStatus::Held => Outcome::Migrated,
            MigrationStatus::Planned => Outcome::Skipped(format!(
                "dry-run, would move to {}",
                self.destination.as_deref().unwrap_or("<control plane choice>")
            )),
            MigrationStatus::Skipped(reason) => Outcome::Skipped(reason.clone()),
            MigrationStatus::Failed(reason) => Outcome::Failed(reason.clone()),
            MigrationStatus::Pending | MigrationStatus::Running => {
                Outcome::Failed("migration never resolved".into())
            }
        }
    }
}

/// Result of emptying one host.
#[derive(Debug, Clone)]
pub struct DrainResult {
    pub host_id: String,
    pub host_name: String,
    pub attempted: usize,
    pub remaining: usize,
    pub elapsed: Duration,
    pub success: bool,
    /// Reason the pass stopped early, if it did.
    pub failure: Option<String>,
    pub jobs: Vec<MigrationJob>,
}

impl DrainResult {
    pub fn failed_jobs(&self) -> impl Iterator<Item = &MigrationJob> {
        self.jobs
            .iter()
            .filter(|job| matches!(job.status, MigrationStatus::Failed(_)))
    }
}
