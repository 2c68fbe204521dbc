//! [`ControlPlane`] over the CloudStack/Cosmic management API.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use libhvdrain::config::ApiConfig;
use libhvdrain::control::ControlPlane;
use libhvdrain::error::TransientApiFailure;
use libhvdrain::log::*;
use libhvdrain::model::{
    AllocationState, AsyncJobStatus, Cluster, Host, HostFilter, HostTransition, JobId,
    ManagedState, MigrationCandidate, Workload, WorkloadFilter, WorkloadKind,
};
use serde::de::DeserializeOwned;

pub mod sign;
pub mod wire;

use wire::{
    ClusterList, DedicatedHostList, HostList, JobResponse, JobResult, RouterList, SystemVmList,
    VirtualMachineList,
};

type Params = Vec<(&'static str, String)>;

#[derive(Clone)]
pub struct CloudStackClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    secret_key: String,
}

impl fmt::Debug for CloudStackClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudStackClient")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl CloudStackClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            url: config.url().clone(),
            api_key: config.api_key().clone(),
            secret_key: config.secret_key().clone(),
        })
    }

    async fn request<T: DeserializeOwned>(&self, command: &'static str, params: Params) -> Result<T> {
        let mut all = vec![
            ("command".to_string(), command.to_string()),
            ("response".to_string(), "json".to_string()),
            ("apiKey".to_string(), self.api_key.clone()),
        ];
        all.extend(params.into_iter().map(|(k, v)| (k.to_string(), v)));
        let url = format!("{}?{}", self.url, sign::signed_query(&all, &self.secret_key));
        trace!("GET {} {:?}", command, &all[3..]);

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                return Err(anyhow::Error::new(TransientApiFailure(format!("{}: {}", command, err))))
            }
            Err(err) => return Err(err).with_context(|| format!("calling {}", command)),
        };
        let status = response.status().as_u16();
        let body: serde_json::Value = match response.json().await {
            Ok(body) => body,
            Err(err) if status >= 500 => {
                return Err(anyhow::Error::new(TransientApiFailure(format!(
                    "{} returned {}: {}",
                    command, status, err
                ))))
            }
            Err(err) => return Err(err).with_context(|| format!("reading {} response", command)),
        };
        debug!("{} -> {}", command, status);
        wire::unwrap_response(command, status, body)
    }

    async fn job(&self, command: &'static str, params: Params) -> Result<JobId> {
        let response: JobResponse = self.request(command, params).await?;
        Ok(JobId(response.jobid))
    }

    /// Host id to the affinity group it is dedicated to.
    async fn dedications(&self) -> Result<HashMap<String, String>> {
        let list: DedicatedHostList = self.request("listDedicatedHosts", vec![]).await?;
        Ok(list
            .dedicatedhost
            .into_iter()
            .map(|d| (d.hostid, d.affinitygroupid))
            .collect())
    }
}

fn push_some(params: &mut Params, key: &'static str, value: Option<&str>) {
    if let Some(value) = value {
        params.push((key, value.to_string()));
    }
}

fn project_params(params: &mut Params, project: bool) {
    params.push(("listall", "true".into()));
    if project {
        params.push(("projectid", "-1".into()));
    }
}

#[async_trait]
impl ControlPlane for CloudStackClient {
    async fn list_clusters(&self, name: Option<&str>) -> Result<Vec<Cluster>> {
        let mut params = vec![];
        push_some(&mut params, "name", name);
        let list: ClusterList = self.request("listClusters", params).await?;
        list.cluster.into_iter().map(Cluster::try_from).collect()
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>> {
        let mut params = vec![("type", "Routing".to_string())];
        push_some(&mut params, "id", filter.id.as_deref());
        push_some(&mut params, "name", filter.name.as_deref());
        push_some(&mut params, "clusterid", filter.cluster_id.as_deref());
        let list: HostList = self.request("listHosts", params).await?;
        let dedications = self.dedications().await?;
        list.host
            .into_iter()
            .map(|h| h.into_host(&dedications))
            .collect()
    }

    async fn list_workloads(&self, filter: &WorkloadFilter) -> Result<Vec<Workload>> {
        let mut params = vec![];
        push_some(&mut params, "id", filter.id.as_deref());
        push_some(&mut params, "hostid", filter.host_id.as_deref());
        match filter.kind {
            WorkloadKind::Instance => {
                project_params(&mut params, filter.project);
                let list: VirtualMachineList = self.request("listVirtualMachines", params).await?;
                Ok(list.virtualmachine.into_iter().map(Workload::from).collect())
            }
            WorkloadKind::Router => {
                project_params(&mut params, filter.project);
                if let Some(group) = filter.redundancy_group.as_deref() {
                    let (key, id) = wire::redundancy_group_param(group)
                        .with_context(|| format!("malformed redundancy group {}", group))?;
                    params.push((key, id.to_string()));
                }
                let list: RouterList = self.request("listRouters", params).await?;
                Ok(list.router.into_iter().map(Workload::from).collect())
            }
            // System VMs never belong to a project.
            WorkloadKind::SystemVm if filter.project => Ok(vec![]),
            WorkloadKind::SystemVm => {
                let list: SystemVmList = self.request("listSystemVms", params).await?;
                Ok(list.systemvm.into_iter().map(Workload::from).collect())
            }
        }
    }

    async fn find_migration_candidates(&self, workload: &Workload) -> Result<Vec<MigrationCandidate>> {
        let params = vec![("virtualmachineid", workload.id.clone())];
        let list: HostList = self.request("findHostsForMigration", params).await?;
        let dedications = self.dedications().await?;
        list.host
            .into_iter()
            .map(|h| h.into_candidate(&dedications))
            .collect()
    }

    async fn set_host_resource_state(&self, host_id: &str, target: HostTransition) -> Result<JobId> {
        let command = match target {
            HostTransition::PrepareForMaintenance => "prepareHostForMaintenance",
            HostTransition::CancelMaintenance => "cancelHostMaintenance",
        };
        self.job(command, vec![("id", host_id.to_string())]).await
    }

    async fn migrate_workload(
        &self,
        workload: &Workload,
        dest_host_id: &str,
        with_volume: bool,
    ) -> Result<JobId> {
        let command = match workload.kind {
            WorkloadKind::Instance if with_volume => "migrateVirtualMachineWithVolume",
            WorkloadKind::Instance => "migrateVirtualMachine",
            WorkloadKind::Router | WorkloadKind::SystemVm => "migrateSystemVm",
        };
        let params = vec![
            ("virtualmachineid", workload.id.clone()),
            ("hostid", dest_host_id.to_string()),
        ];
        self.job(command, params).await
    }

    async fn poll_job(&self, job: &JobId) -> Result<AsyncJobStatus> {
        let result: JobResult = self
            .request("queryAsyncJobResult", vec![("jobid", job.0.clone())])
            .await?;
        Ok(result.status())
    }

    async fn set_cluster_managed_state(&self, cluster_id: &str, state: ManagedState) -> Result<()> {
        let params = vec![("id", cluster_id.to_string()), ("managedstate", state.to_string())];
        let _: serde_json::Value = self.request("updateCluster", params).await?;
        Ok(())
    }

    async fn set_cluster_allocation_state(
        &self,
        cluster_id: &str,
        state: AllocationState,
    ) -> Result<()> {
        let params = vec![("id", cluster_id.to_string()), ("allocationstate", state.to_string())];
        let _: serde_json::Value = self.request("updateCluster", params).await?;
        Ok(())
    }

    async fn start_workload(&self, workload: &Workload, host_id: &str) -> Result<JobId> {
        let mut params = vec![("id", workload.id.clone())];
        let command = match workload.kind {
            WorkloadKind::Instance => {
                params.push(("hostid", host_id.to_string()));
                "startVirtualMachine"
            }
            WorkloadKind::Router => "startRouter",
            WorkloadKind::SystemVm => "startSystemVm",
        };
        self.job(command, params).await
    }

    async fn stop_workload(&self, workload: &Workload) -> Result<JobId> {
        let command = match workload.kind {
            WorkloadKind::Instance => "stopVirtualMachine",
            WorkloadKind::Router => "stopRouter",
            WorkloadKind::SystemVm => "stopSystemVm",
        };
        self.job(command, vec![("id", workload.id.clone())]).await
    }

    async fn detach_removable_media(&self, workload: &Workload) -> Result<JobId> {
        self.job("detachIso", vec![("virtualmachineid", workload.id.clone())])
            .await
    }
}
