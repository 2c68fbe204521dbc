//! Picking a landing host for a workload.
//!
//! Placement is a single greedy pass over fresh cluster state: the candidate
//! with the most free memory wins, first seen on ties. Nothing is reserved
//! between calls, so two concurrent migrations can pick the same host; the
//! control plane rejects whichever one no longer fits.

use std::collections::BTreeSet;

use crate::context::DrainContext;
use crate::error::{DrainError, Result};
use crate::inventory::ClusterInventory;
use crate::log::*;
use crate::model::{Bytes, Host, Workload};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementRequest {
    pub cluster_id: String,
    pub exclude_host: String,
    pub required_memory: Bytes,
    pub required_tags: BTreeSet<String>,
    pub dedication_group: Option<String>,
    /// Host ids that must not be chosen, e.g. hosts running a redundant peer.
    pub avoid_hosts: BTreeSet<String>,
}

impl PlacementRequest {
    pub fn for_workload(workload: &Workload, source: &Host) -> Self {
        Self {
            cluster_id: source.cluster_id.clone(),
            exclude_host: source.name.clone(),
            required_memory: workload.memory,
            required_tags: workload.required_tags.clone(),
            dedication_group: workload.dedication_group.clone(),
            avoid_hosts: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Selected(Host),
    NotFound,
}

impl Placement {
    pub fn host(self) -> Option<Host> {
        match self {
            Placement::Selected(host) => Some(host),
            Placement::NotFound => None,
        }
    }
}

/// A dedicated workload lands only in its own group; anything else stays off
/// dedicated hosts.
pub fn dedication_allows(workload_group: Option<&str>, host_group: Option<&str>) -> bool {
    match (workload_group, host_group) {
        (Some(want), Some(have)) => want == have,
        (Some(_), None) => false,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

#[derive(Debug, Clone)]
pub struct PlacementSelector {
    ctx: DrainContext,
    inventory: ClusterInventory,
}

impl PlacementSelector {
    pub fn new(ctx: DrainContext) -> Self {
        Self {
            inventory: ClusterInventory::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn select_host(
        &self,
        cluster_id: &str,
        exclude_host: &str,
        required_memory: Bytes,
        required_tags: Option<&BTreeSet<String>>,
    ) -> Result<Placement> {
        self.select(&PlacementRequest {
            cluster_id: cluster_id.to_string(),
            exclude_host: exclude_host.to_string(),
            required_memory,
            required_tags: required_tags.cloned().unwrap_or_default(),
            ..Default::default()
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn select(&self, request: &PlacementRequest) -> Result<Placement> {
        let timeout = self.ctx.options.call_timeout;
        let hosts = tokio::time::timeout(timeout, self.inventory.hosts(&request.cluster_id))
            .await
            .map_err(|_| DrainError::Timeout {
                what: format!("listing hosts of cluster {}", request.cluster_id),
                after: timeout,
            })??;
        Ok(self.best_fit(&hosts, request))
    }

    /// The filtering and max-reduction, on an already fetched host list.
    pub fn best_fit(&self, hosts: &[Host], request: &PlacementRequest) -> Placement {
        let mut best: Option<&Host> = None;
        for host in hosts {
            if !self.eligible(host, request) {
                continue;
            }
            let available = host.available_memory();
            if available < request.required_memory {
                trace!(
                    "placement: {} has {} bytes free, {} required",
                    host.name,
                    available,
                    request.required_memory
                );
                continue;
            }
            if best.map_or(true, |b| available > b.available_memory()) {
                best = Some(host);
            }
        }

        match best {
            Some(host) => {
                debug!(
                    "placement: selected {} with {} bytes free",
                    host.name,
                    host.available_memory()
                );
                Placement::Selected(host.clone())
            }
            None => Placement::NotFound,
        }
    }

    fn eligible(&self, host: &Host, request: &PlacementRequest) -> bool {
        if host.name == request.exclude_host || request.avoid_hosts.contains(&host.id) {
            return false;
        }
        if !host.suitable_for_migration
            || !host.resource_state.accepts_workloads()
            || !host.connection_state.accepts_workloads()
        {
            trace!(
                "placement: skipping {} ({}, {}, suitable={})",
                host.name,
                host.resource_state,
                host.connection_state,
                host.suitable_for_migration
            );
            return false;
        }
        if !dedication_allows(
            request.dedication_group.as_deref(),
            host.dedication_group.as_deref(),
        ) {
            return false;
        }
        if !host.has_tags(&request.required_tags) {
            if !self.ctx.options.allow_tag_mismatch {
                return false;
            }
            warn!(
                "placement: {} lacks tags {:?}, allowed by override",
                host.name, request.required_tags
            );
        }
        true
    }
}
