//! Driving a host in and out of maintenance mode.
//!
//! The control plane owns the actual state; this module issues the
//! transition and then watches the host until it settles. A host whose
//! resident count stops moving is given up on after a fixed number of polls
//! rather than watched forever.

use crate::context::DrainContext;
use crate::control::{wait_for_job, with_retries};
use crate::drain::HostDrainCoordinator;
use crate::error::{DrainError, Result};
use crate::inventory::ClusterInventory;
use crate::log::*;
use crate::model::{Host, HostTransition, ResourceState};
use crate::poll::{PollOutcome, Tick};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Maintenance,
    ErrorInMaintenance(String),
    /// The host went back to Enabled, i.e. maintenance was cancelled.
    Enabled,
}

#[derive(Debug, Clone)]
pub struct MaintenanceStateMachine {
    ctx: DrainContext,
    inventory: ClusterInventory,
    drain: HostDrainCoordinator,
}

impl MaintenanceStateMachine {
    pub fn new(ctx: DrainContext) -> Self {
        Self {
            inventory: ClusterInventory::new(ctx.clone()),
            drain: HostDrainCoordinator::new(ctx.clone()),
            ctx,
        }
    }

    /// Refuse to touch `host` while another host of its cluster is in any
    /// maintenance state, unless forced.
    pub async fn check_cluster_safety(&self, host: &Host) -> Result<()> {
        let busy = self
            .inventory
            .hosts_in_maintenance(&host.cluster_id, &host.name)
            .await?;
        if busy.is_empty() {
            return Ok(());
        }
        let hosts: Vec<String> = busy.into_iter().map(|h| h.name).collect();
        if self.ctx.options.force {
            warn!(
                "forced: {} already in maintenance in {}",
                hosts.join(", "),
                host.cluster_name
            );
            return Ok(());
        }
        Err(DrainError::UnsafeClusterState {
            cluster: host.cluster_name.clone(),
            hosts,
        })
    }

    /// Drain `host` and put it into maintenance. A host already in
    /// Maintenance is left alone.
    #[tracing::instrument(skip_all, fields(host = %host.name))]
    pub async fn enter_maintenance(&self, host: &Host) -> Result<MaintenanceOutcome> {
        let current = self.inventory.host_by_id(&host.id).await?;
        if current.resource_state == ResourceState::Maintenance {
            progress(2, format!("{} is already in maintenance", current.name));
            return Ok(MaintenanceOutcome::Maintenance);
        }
        self.check_cluster_safety(&current).await?;
        self.drain.drain_with_retries(&current).await?;
        self.prepare_for_maintenance(&current).await
    }

    /// Issue the maintenance transition without draining first and watch
    /// the host until it settles.
    #[tracing::instrument(skip_all, fields(host = %host.name))]
    pub async fn prepare_for_maintenance(&self, host: &Host) -> Result<MaintenanceOutcome> {
        let current = self.inventory.host_by_id(&host.id).await?;
        match current.resource_state {
            ResourceState::Maintenance => return Ok(MaintenanceOutcome::Maintenance),
            ResourceState::Error => {
                return Err(DrainError::InvalidTransition {
                    host: current.name,
                    action: "enter maintenance",
                    state: current.resource_state.to_string(),
                })
            }
            _ => {}
        }

        if self.ctx.dry_run() {
            progress(2, format!("would put {} into maintenance", current.name));
            return Ok(MaintenanceOutcome::Maintenance);
        }

        progress(2, format!("putting {} into maintenance", current.name));
        if current.resource_state != ResourceState::PrepareForMaintenance {
            let control = &self.ctx.control;
            let job = with_retries(&self.ctx, "prepareHostForMaintenance", || {
                control.set_host_resource_state(&current.id, HostTransition::PrepareForMaintenance)
            })
            .await
            .map_err(DrainError::api("prepareHostForMaintenance"))?;
            wait_for_job(&self.ctx, &job)
                .await
                .map_err(DrainError::api("prepareHostForMaintenance"))?;
        }

        self.watch_maintenance(&current).await
    }

    async fn watch_maintenance(&self, host: &Host) -> Result<MaintenanceOutcome> {
        let stall_polls = self.ctx.options.stall_polls.max(1);
        let poller = self.ctx.poller();
        let mut ticker = poller.ticker();
        let mut seen_prepare = false;
        let mut last_count = None;
        let mut unchanged = 0;
        loop {
            match ticker.tick().await {
                Tick::Poll(_) => {}
                Tick::Exhausted | Tick::Cancelled => {
                    return Err(DrainError::Interrupted {
                        next_host: host.name.clone(),
                    })
                }
            }

            let current = self.inventory.host_by_id(&host.id).await?;
            match current.resource_state {
                ResourceState::Maintenance => {
                    progress(2, format!("{} is in maintenance", current.name));
                    return Ok(MaintenanceOutcome::Maintenance);
                }
                ResourceState::ErrorInMaintenance => {
                    error!("{} went into ErrorInMaintenance", current.name);
                    return Ok(MaintenanceOutcome::ErrorInMaintenance(
                        "control plane reported ErrorInMaintenance".into(),
                    ));
                }
                ResourceState::PrepareForMaintenance => seen_prepare = true,
                ResourceState::Enabled if seen_prepare => {
                    warn!("maintenance of {} was cancelled", current.name);
                    return Ok(MaintenanceOutcome::Enabled);
                }
                _ => {}
            }

            let count = self.inventory.resident_count(&current).await?;
            if last_count == Some(count) {
                unchanged += 1;
            } else {
                last_count = Some(count);
                unchanged = 1;
            }
            debug!(
                "{} is {} with {} resident ({} unchanged poll(s))",
                current.name, current.resource_state, count, unchanged
            );
            if unchanged >= stall_polls {
                error!(
                    "{} made no progress towards maintenance in {} polls",
                    current.name, stall_polls
                );
                return Ok(MaintenanceOutcome::ErrorInMaintenance(format!(
                    "stalled with {count} workload(s) resident"
                )));
            }
        }
    }

    /// Bring a host back out of maintenance and wait until it is Enabled and
    /// Up. A host that is already Enabled is left alone.
    #[tracing::instrument(skip_all, fields(host = %host.name))]
    pub async fn cancel_maintenance(&self, host: &Host) -> Result<MaintenanceOutcome> {
        let current = self.inventory.host_by_id(&host.id).await?;
        match current.resource_state {
            ResourceState::Enabled => {
                progress(2, format!("{} is not in maintenance", current.name));
                return Ok(MaintenanceOutcome::Enabled);
            }
            ResourceState::PrepareForMaintenance
            | ResourceState::Maintenance
            | ResourceState::ErrorInMaintenance => {}
            state => {
                return Err(DrainError::InvalidTransition {
                    host: current.name,
                    action: "cancel maintenance",
                    state: state.to_string(),
                })
            }
        }

        if self.ctx.dry_run() {
            progress(2, format!("would take {} out of maintenance", current.name));
            return Ok(MaintenanceOutcome::Enabled);
        }

        progress(2, format!("taking {} out of maintenance", current.name));
        let control = &self.ctx.control;
        let job = with_retries(&self.ctx, "cancelHostMaintenance", || {
            control.set_host_resource_state(&current.id, HostTransition::CancelMaintenance)
        })
        .await
        .map_err(DrainError::api("cancelHostMaintenance"))?;
        wait_for_job(&self.ctx, &job)
            .await
            .map_err(DrainError::api("cancelHostMaintenance"))?;

        let inventory = &self.inventory;
        let id = current.id.as_str();
        let settled = self
            .ctx
            .poller()
            .until(|| async move {
                let host = inventory.host_by_id(id).await?;
                Ok(host.is_up_and_enabled().then_some(()))
            })
            .await
            .map_err(DrainError::api("listHosts"))?;
        match settled {
            PollOutcome::Ready(()) => {
                progress(2, format!("{} is enabled", current.name));
                Ok(MaintenanceOutcome::Enabled)
            }
            PollOutcome::Exhausted | PollOutcome::Cancelled => Err(DrainError::Interrupted {
                next_host: current.name,
            }),
        }
    }
}
