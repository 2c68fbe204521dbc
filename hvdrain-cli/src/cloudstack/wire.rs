//! Response shapes of the management API and their conversion into the
//! library's typed records. Nothing outside this module sees raw JSON.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use libhvdrain::error::TransientApiFailure;
use libhvdrain::model::{
    AllocationState, AsyncJobStatus, Cluster, ConnectionState, Host, MaintenancePolicy,
    ManagedState, MigrationCandidate, RedundantState, Workload, WorkloadKind, WorkloadState,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

const MIB: u64 = 1024 * 1024;
const DEDICATION_AFFINITY_TYPE: &str = "ExplicitDedication";

/// Pull the `<command>response` object out of a reply and decode it. HTTP
/// errors carry the server's `errortext`; 5xx replies are retryable.
pub fn unwrap_response<T: DeserializeOwned>(command: &str, status: u16, body: Value) -> Result<T> {
    let key = format!("{}response", command.to_lowercase());
    let inner = match body {
        Value::Object(mut map) => map
            .remove(&key)
            .or_else(|| map.into_iter().next().map(|(_, v)| v))
            .unwrap_or(Value::Null),
        other => other,
    };
    // Empty lists come back as `{}` or not at all.
    let inner = match inner {
        Value::Null => Value::Object(Default::default()),
        inner => inner,
    };

    if status >= 400 {
        let error: ApiError = serde_json::from_value(inner).unwrap_or_default();
        let message = format!(
            "{} returned {} ({}): {}",
            command,
            status,
            error.errorcode.unwrap_or(status as i64),
            error.errortext.as_deref().unwrap_or("no error text")
        );
        if status >= 500 {
            return Err(anyhow::Error::new(TransientApiFailure(message)));
        }
        anyhow::bail!(message);
    }

    serde_json::from_value(inner).with_context(|| format!("decoding {} response", command))
}

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    #[serde(default)]
    errorcode: Option<i64>,
    #[serde(default)]
    errortext: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterList {
    #[serde(default)]
    pub cluster: Vec<WireCluster>,
}

#[derive(Debug, Deserialize)]
pub struct HostList {
    #[serde(default)]
    pub host: Vec<WireHost>,
}

#[derive(Debug, Deserialize)]
pub struct DedicatedHostList {
    #[serde(default)]
    pub dedicatedhost: Vec<WireDedicatedHost>,
}

#[derive(Debug, Deserialize)]
pub struct VirtualMachineList {
    #[serde(default)]
    pub virtualmachine: Vec<WireVirtualMachine>,
}

#[derive(Debug, Deserialize)]
pub struct RouterList {
    #[serde(default)]
    pub router: Vec<WireRouter>,
}

#[derive(Debug, Deserialize)]
pub struct SystemVmList {
    #[serde(default)]
    pub systemvm: Vec<WireSystemVm>,
}

#[derive(Debug, Deserialize)]
pub struct JobResponse {
    pub jobid: String,
}

#[derive(Debug, Deserialize)]
pub struct JobResult {
    pub jobstatus: i64,
    #[serde(default)]
    pub jobresult: Option<Value>,
}

impl JobResult {
    pub fn status(&self) -> AsyncJobStatus {
        match self.jobstatus {
            0 => AsyncJobStatus::Pending,
            1 => AsyncJobStatus::Succeeded,
            _ => AsyncJobStatus::Failed(
                self.jobresult
                    .as_ref()
                    .and_then(|r| r.get("errortext"))
                    .and_then(Value::as_str)
                    .unwrap_or("job failed without error text")
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireCluster {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub podid: String,
    #[serde(default)]
    pub zoneid: String,
    pub hypervisortype: String,
    #[serde(default)]
    pub allocationstate: String,
    #[serde(default)]
    pub managedstate: String,
}

impl TryFrom<WireCluster> for Cluster {
    type Error = anyhow::Error;

    fn try_from(c: WireCluster) -> Result<Self> {
        Ok(Cluster {
            hypervisor: c.hypervisortype.parse().map_err(anyhow::Error::msg)?,
            allocation_state: match c.allocationstate.as_str() {
                "Disabled" => AllocationState::Disabled,
                _ => AllocationState::Enabled,
            },
            managed_state: match c.managedstate.as_str() {
                "Managed" | "" => ManagedState::Managed,
                _ => ManagedState::Unmanaged,
            },
            id: c.id,
            name: c.name,
            pod_id: c.podid,
            zone_id: c.zoneid,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WireHost {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ipaddress: String,
    #[serde(default)]
    pub clusterid: String,
    #[serde(default)]
    pub clustername: String,
    #[serde(default)]
    pub podid: String,
    pub hypervisor: String,
    pub resourcestate: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub memorytotal: u64,
    /// Bytes on older servers, a `"42.5%"` string on newer ones.
    #[serde(default)]
    pub memoryallocated: Option<Value>,
    #[serde(default)]
    pub memoryallocatedbytes: Option<u64>,
    #[serde(default)]
    pub hosttags: Option<String>,
    #[serde(default)]
    pub suitableformigration: Option<bool>,
    #[serde(default, rename = "requiresStorageMotion")]
    pub requires_storage_motion: bool,
}

impl WireHost {
    fn allocated_bytes(&self) -> u64 {
        if let Some(bytes) = self.memoryallocatedbytes {
            return bytes;
        }
        match &self.memoryallocated {
            Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
            Some(Value::String(s)) => match s.trim_end_matches('%').parse::<f64>() {
                Ok(percent) if s.ends_with('%') => {
                    (self.memorytotal as f64 * percent / 100.0).round() as u64
                }
                Ok(bytes) => bytes as u64,
                Err(_) => 0,
            },
            _ => 0,
        }
    }

    /// Convert, attaching the affinity group the host is dedicated to.
    pub fn into_host(self, dedications: &HashMap<String, String>) -> Result<Host> {
        let memory_allocated = self.allocated_bytes();
        Ok(Host {
            hypervisor: self.hypervisor.parse().map_err(anyhow::Error::msg)?,
            resource_state: self.resourcestate.parse().map_err(anyhow::Error::msg)?,
            connection_state: ConnectionState::from(self.state.as_str()),
            memory_total: self.memorytotal,
            memory_allocated,
            host_tags: split_tags(self.hosttags.as_deref()),
            suitable_for_migration: self.suitableformigration.unwrap_or(true),
            dedication_group: dedications.get(&self.id).cloned(),
            id: self.id,
            name: self.name,
            address: self.ipaddress,
            cluster_id: self.clusterid,
            cluster_name: self.clustername,
            pod_id: self.podid,
        })
    }

    pub fn into_candidate(self, dedications: &HashMap<String, String>) -> Result<MigrationCandidate> {
        let requires_storage_motion = self.requires_storage_motion;
        let suitable = self.suitableformigration.unwrap_or(false);
        Ok(MigrationCandidate {
            host: self.into_host(dedications)?,
            requires_storage_motion,
            suitable,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WireDedicatedHost {
    pub hostid: String,
    pub affinitygroupid: String,
}

#[derive(Debug, Deserialize)]
pub struct WireAffinityGroup {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct WireVirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instancename: Option<String>,
    pub state: String,
    /// MiB.
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub hostid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub isoid: Option<String>,
    #[serde(default)]
    pub projectid: Option<String>,
    #[serde(default)]
    pub affinitygroup: Vec<WireAffinityGroup>,
    #[serde(default)]
    pub maintenancepolicy: Option<String>,
}

impl From<WireVirtualMachine> for Workload {
    fn from(vm: WireVirtualMachine) -> Self {
        let dedication_group = vm
            .affinitygroup
            .iter()
            .find(|g| g.kind == DEDICATION_AFFINITY_TYPE)
            .map(|g| g.id.clone());
        Workload {
            instance_name: vm.instancename.unwrap_or_else(|| vm.name.clone()),
            kind: WorkloadKind::Instance,
            state: WorkloadState::from(vm.state.as_str()),
            memory: vm.memory * MIB,
            required_tags: BTreeSet::new(),
            host_id: vm.hostid,
            host_name: vm.hostname,
            project: vm.projectid.is_some(),
            iso_attached: vm.isoid.is_some(),
            dedication_group,
            local_storage: false,
            redundancy_group: None,
            is_redundant_router: false,
            redundant_state: RedundantState::Unknown,
            maintenance_policy: match vm.maintenancepolicy.as_deref() {
                Some("ShutdownAndStart") => MaintenancePolicy::ShutdownAndStart,
                _ => MaintenancePolicy::Normal,
            },
            id: vm.id,
            name: vm.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireRouter {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub hostid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub isredundantrouter: bool,
    #[serde(default)]
    pub redundantstate: Option<String>,
    #[serde(default)]
    pub guestnetworkid: Option<String>,
    #[serde(default)]
    pub vpcid: Option<String>,
    #[serde(default)]
    pub projectid: Option<String>,
}

impl From<WireRouter> for Workload {
    fn from(r: WireRouter) -> Self {
        let redundancy_group = match (&r.vpcid, &r.guestnetworkid) {
            (Some(vpc), _) => Some(format!("vpc:{}", vpc)),
            (None, Some(network)) => Some(format!("network:{}", network)),
            (None, None) => None,
        };
        Workload {
            instance_name: r.name.clone(),
            kind: WorkloadKind::Router,
            state: WorkloadState::from(r.state.as_str()),
            memory: 0,
            required_tags: BTreeSet::new(),
            host_id: r.hostid,
            host_name: r.hostname,
            project: r.projectid.is_some(),
            iso_attached: false,
            dedication_group: None,
            local_storage: false,
            redundancy_group,
            is_redundant_router: r.isredundantrouter,
            redundant_state: r
                .redundantstate
                .as_deref()
                .map(RedundantState::from)
                .unwrap_or(RedundantState::Unknown),
            maintenance_policy: MaintenancePolicy::Normal,
            id: r.id,
            name: r.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WireSystemVm {
    pub id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub hostid: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl From<WireSystemVm> for Workload {
    fn from(s: WireSystemVm) -> Self {
        Workload {
            instance_name: s.name.clone(),
            kind: WorkloadKind::SystemVm,
            state: WorkloadState::from(s.state.as_str()),
            memory: 0,
            required_tags: BTreeSet::new(),
            host_id: s.hostid,
            host_name: s.hostname,
            project: false,
            iso_attached: false,
            dedication_group: None,
            local_storage: false,
            redundancy_group: None,
            is_redundant_router: false,
            redundant_state: RedundantState::Unknown,
            maintenance_policy: MaintenancePolicy::Normal,
            id: s.id,
            name: s.name,
        }
    }
}

/// Split a redundancy group written by [`WireRouter`] back into the list
/// parameter that selects it.
pub fn redundancy_group_param(group: &str) -> Option<(&'static str, &str)> {
    match group.split_once(':') {
        Some(("vpc", id)) => Some(("vpcid", id)),
        Some(("network", id)) => Some(("networkid", id)),
        _ => None,
    }
}

fn split_tags(tags: Option<&str>) -> BTreeSet<String> {
    tags.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use libhvdrain::error::is_transient;
    use libhvdrain::model::{Hypervisor, ResourceState, GIB};
    use serde_json::json;

    #[test]
    fn test_hosts_decode_with_percentage_allocation() -> Result<()> {
        let body = json!({
            "listhostsresponse": {
                "count": 1,
                "host": [{
                    "id": "h1",
                    "name": "hv01",
                    "ipaddress": "10.0.0.1",
                    "clusterid": "c1",
                    "clustername": "cluster1",
                    "podid": "p1",
                    "hypervisor": "KVM",
                    "resourcestate": "Enabled",
                    "state": "Up",
                    "memorytotal": 64 * GIB,
                    "memoryallocated": "25%",
                    "hosttags": "ssd, gpu"
                }]
            }
        });
        let list: HostList = unwrap_response("listHosts", 200, body)?;
        let dedications = HashMap::from([("h1".to_string(), "ag1".to_string())]);
        let host = list.host.into_iter().next().context("no host")?.into_host(&dedications)?;
        assert_eq!(Hypervisor::Kvm, host.hypervisor);
        assert_eq!(ResourceState::Enabled, host.resource_state);
        assert_eq!(16 * GIB, host.memory_allocated);
        assert_eq!(48 * GIB, host.available_memory());
        assert!(host.host_tags.contains("gpu"));
        assert_eq!(Some("ag1"), host.dedication_group.as_deref());
        Ok(())
    }

    #[test]
    fn test_empty_list_is_not_an_error() -> Result<()> {
        let list: VirtualMachineList =
            unwrap_response("listVirtualMachines", 200, json!({"listvirtualmachinesresponse": {}}))?;
        assert!(list.virtualmachine.is_empty());
        Ok(())
    }

    #[test]
    fn test_server_errors_are_transient() {
        let body = json!({"migratevirtualmachineresponse": {"errorcode": 530, "errortext": "db lock"}});
        let err = unwrap_response::<JobResponse>("migrateVirtualMachine", 530, body).unwrap_err();
        assert!(is_transient(&err));
        assert!(err.to_string().contains("db lock"));

        let body = json!({"migratevirtualmachineresponse": {"errorcode": 431, "errortext": "bad host"}});
        let err = unwrap_response::<JobResponse>("migrateVirtualMachine", 431, body).unwrap_err();
        assert!(!is_transient(&err));
    }

    #[test]
    fn test_router_redundancy_group() {
        let router: WireRouter = serde_json::from_value(json!({
            "id": "r1",
            "name": "r-12-VM",
            "state": "Running",
            "hostid": "h1",
            "isredundantrouter": true,
            "redundantstate": "BACKUP",
            "guestnetworkid": "n1",
            "vpcid": "v1"
        }))
        .unwrap();
        let workload = Workload::from(router);
        assert_eq!(Some("vpc:v1"), workload.redundancy_group.as_deref());
        assert_eq!(RedundantState::Backup, workload.redundant_state);
        assert_eq!(Some(("vpcid", "v1")), redundancy_group_param("vpc:v1"));
        assert_eq!(None, redundancy_group_param("v1"));
    }

    #[test]
    fn test_vm_memory_and_dedication() {
        let vm: WireVirtualMachine = serde_json::from_value(json!({
            "id": "v1",
            "name": "web",
            "instancename": "i-2-10-VM",
            "state": "Running",
            "memory": 2048,
            "isoid": "iso1",
            "affinitygroup": [{"id": "ag1", "type": "ExplicitDedication"}]
        }))
        .unwrap();
        let workload = Workload::from(vm);
        assert_eq!(2 * GIB, workload.memory);
        assert!(workload.iso_attached);
        assert!(workload.is_running());
        assert_eq!(Some("ag1"), workload.dedication_group.as_deref());
    }

    #[test]
    fn test_job_status() {
        let failed: JobResult = serde_json::from_value(json!({
            "jobstatus": 2,
            "jobresult": {"errortext": "no capacity"}
        }))
        .unwrap();
        assert_eq!(AsyncJobStatus::Failed("no capacity".into()), failed.status());
        let pending: JobResult = serde_json::from_value(json!({"jobstatus": 0})).unwrap();
        assert_eq!(AsyncJobStatus::Pending, pending.status());
    }
}
