use crate::context::DrainContext;
use crate::control::with_retries;
use crate::error::{DrainError, Result};
use crate::log::*;
use crate::model::{Cluster, Host, HostFilter, Workload, WorkloadFilter, WorkloadKind};

/// Typed queries against the control plane: clusters, their hosts and what
/// runs on them.
#[derive(Debug, Clone)]
pub struct ClusterInventory {
    ctx: DrainContext,
}

impl ClusterInventory {
    pub fn new(ctx: DrainContext) -> Self {
        Self { ctx }
    }

    #[tracing::instrument(skip(self))]
    pub async fn cluster(&self, name: &str) -> Result<Cluster> {
        let control = &self.ctx.control;
        let clusters = with_retries(&self.ctx, "listClusters", || control.list_clusters(Some(name)))
            .await
            .map_err(DrainError::api("listClusters"))?;
        clusters
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DrainError::not_found("cluster", name))
    }

    /// Hosts of a cluster, in control plane order.
    pub async fn hosts(&self, cluster_id: &str) -> Result<Vec<Host>> {
        let filter = HostFilter::cluster(cluster_id);
        self.list_hosts(&filter).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn host(&self, name: &str) -> Result<Host> {
        let hosts = self.list_hosts(&HostFilter::name(name)).await?;
        hosts
            .into_iter()
            .find(|h| h.name == name)
            .ok_or_else(|| DrainError::not_found("host", name))
    }

    pub async fn host_by_id(&self, id: &str) -> Result<Host> {
        let hosts = self.list_hosts(&HostFilter::id(id)).await?;
        hosts
            .into_iter()
            .find(|h| h.id == id)
            .ok_or_else(|| DrainError::not_found("host", id))
    }

    /// Everything running on `host`, in drain order: instances and project
    /// instances largest first, then routers, project routers and system VMs.
    #[tracing::instrument(skip(self, host), fields(host = %host.name))]
    pub async fn resident_workloads(&self, host: &Host) -> Result<Vec<Workload>> {
        let mut instances = self.list(WorkloadKind::Instance, host, false).await?;
        instances.extend(self.list(WorkloadKind::Instance, host, true).await?);
        instances.sort_by(|a, b| b.memory.cmp(&a.memory));

        let mut resident = instances;
        resident.extend(self.list(WorkloadKind::Router, host, false).await?);
        resident.extend(self.list(WorkloadKind::Router, host, true).await?);
        resident.extend(self.list(WorkloadKind::SystemVm, host, false).await?);
        debug!("{} workloads resident on {}", resident.len(), host.name);
        Ok(resident)
    }

    pub async fn resident_count(&self, host: &Host) -> Result<usize> {
        Ok(self.resident_workloads(host).await?.len())
    }

    async fn list(&self, kind: WorkloadKind, host: &Host, project: bool) -> Result<Vec<Workload>> {
        let filter = WorkloadFilter::on_host(kind, host.id.clone(), project);
        let control = &self.ctx.control;
        let workloads = with_retries(&self.ctx, "listWorkloads", || control.list_workloads(&filter))
            .await
            .map_err(DrainError::api("listWorkloads"))?;
        // The control plane may report workloads in transit; only count the
        // ones it places on this host.
        Ok(workloads.into_iter().filter(|w| w.resides_on(host)).collect())
    }

    /// Other routers serving the same network as `router`.
    pub async fn redundant_peers(&self, router: &Workload) -> Result<Vec<Workload>> {
        let Some(group) = router.redundancy_group.as_ref() else {
            return Ok(vec![]);
        };
        let filter = WorkloadFilter::redundancy_group(group.clone(), router.project);
        let control = &self.ctx.control;
        let peers = with_retries(&self.ctx, "listRouters", || control.list_workloads(&filter))
            .await
            .map_err(DrainError::api("listRouters"))?;
        Ok(peers.into_iter().filter(|p| p.id != router.id).collect())
    }

    async fn list_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>> {
        let control = &self.ctx.control;
        with_retries(&self.ctx, "listHosts", || control.list_hosts(filter))
            .await
            .map_err(DrainError::api("listHosts"))
    }

    /// Hosts of the cluster, other than `except`, in a maintenance state.
    pub async fn hosts_in_maintenance(&self, cluster_id: &str, except: &str) -> Result<Vec<Host>> {
        Ok(self
            .hosts(cluster_id)
            .await?
            .into_iter()
            .filter(|h| h.name != except && h.resource_state.in_maintenance())
            .collect())
    }

    /// Name of the XenServer pool master, asked of any connected member.
    /// `None` for hypervisors without one or when no member answers.
    #[tracing::instrument(skip(self, cluster, hosts), fields(cluster = %cluster.name))]
    pub async fn poolmaster(&self, cluster: &Cluster, hosts: &[Host]) -> Option<String> {
        let uuid_command = cluster.hypervisor.poolmaster_uuid_command()?;
        for host in hosts.iter().filter(|h| h.connection_state.accepts_workloads()) {
            let uuid = match self.ctx.remote.run_command(&host.address, uuid_command).await {
                Ok(out) if out.success() && !out.stdout.trim().is_empty() => out.stdout,
                Ok(out) => {
                    debug!("pool-list on {} exited {}", host.name, out.exit_code);
                    continue;
                }
                Err(err) => {
                    debug!("pool-list on {} failed: {}", host.name, err);
                    continue;
                }
            };
            let name_command = cluster.hypervisor.host_name_command(&uuid)?;
            match self.ctx.remote.run_command(&host.address, &name_command).await {
                Ok(out) if out.success() => {
                    let name = out.stdout.trim().to_string();
                    info!("poolmaster of {} is {}", cluster.name, name);
                    return Some(name);
                }
                Ok(_) | Err(_) => continue,
            }
        }
        warn!("could not determine the poolmaster of {}", cluster.name);
        None
    }
}
