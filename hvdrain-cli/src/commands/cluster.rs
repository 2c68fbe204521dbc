use anyhow::Result;
use async_trait::async_trait;
use clap::ArgMatches;
use libhvdrain::executor::hook::Hooks;
use libhvdrain::hypervisor::RebootAction;
use libhvdrain::inventory::ClusterInventory;
use libhvdrain::log::*;
use libhvdrain::model::GIB;
use libhvdrain::rolling::{ClusterRollingController, RollingOptions};

use super::Arguments;

pub struct ClusterCommand;

impl ClusterCommand {
    fn rolling_options(&self, matches: &ArgMatches) -> RollingOptions {
        let reboot = if matches.get_flag("halt") {
            RebootAction::Halt
        } else if matches.get_flag("force-reset") {
            RebootAction::ForceReset
        } else if matches.get_flag("skip-reboot") {
            RebootAction::Skip
        } else {
            RebootAction::Reboot
        };
        RollingOptions {
            ignore_hosts: matches
                .get_many::<String>("ignore-hosts")
                .map(|hosts| hosts.cloned().collect())
                .unwrap_or_default(),
            reboot,
            hooks: Hooks::new(
                self.read_optional_argument(matches, "pre-script"),
                self.read_optional_argument(matches, "post-script"),
                self.read_optional_argument(matches, "post-reboot-script"),
            ),
            bond_check: !matches.get_flag("no-bond-check"),
            disable_allocation: matches.get_flag("disable-allocation"),
        }
    }

    async fn subcommand_rolling_reboot<'a>(
        &self,
        context: &'a super::CliContext<'a>,
        matches: &ArgMatches,
    ) -> Result<()> {
        let cluster = self.read_argument(matches, "cluster")?;
        let threads = self.read_threads(matches)?;
        let options = self.rolling_options(matches);
        if options.reboot.needs_operator() {
            warn!("hosts will be {:?} and need an operator to power them back on", options.reboot);
        }

        let ctx = context.drain_context(threads).await?;
        let summary = ClusterRollingController::new(ctx).run(&cluster, &options).await?;
        if !summary.succeeded() {
            println!("* some hosts could not be drained, see the summary above");
        }
        Ok(())
    }

    async fn subcommand_status<'a>(
        &self,
        context: &'a super::CliContext<'a>,
        matches: &ArgMatches,
    ) -> Result<()> {
        let name = self.read_argument(matches, "cluster")?;
        let ctx = context.drain_context(1).await?;
        let inventory = ClusterInventory::new(ctx);
        let cluster = inventory.cluster(&name).await?;
        let hosts = inventory.hosts(&cluster.id).await?;
        let poolmaster = if cluster.hypervisor.has_poolmaster() {
            inventory.poolmaster(&cluster, &hosts).await
        } else {
            None
        };

        println!(
            "*** cluster: {} ({}, {}, {}) ***",
            cluster.name, cluster.hypervisor, cluster.allocation_state, cluster.managed_state
        );
        for host in &hosts {
            let resident = inventory.resident_count(host).await?;
            let marker = if poolmaster.as_deref() == Some(host.name.as_str()) {
                " [poolmaster]"
            } else {
                ""
            };
            println!(
                "** {}{}: {}/{}, {:.1}/{:.1} GiB free, {} workload(s)",
                host.name,
                marker,
                host.resource_state,
                host.connection_state,
                host.available_memory() as f64 / GIB as f64,
                host.memory_total as f64 / GIB as f64,
                resident
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> super::Command<'a> for ClusterCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("rolling-reboot", matches)) => {
                self.subcommand_rolling_reboot(context, matches).await?;
            }
            Some(("status", matches)) => {
                self.subcommand_status(context, matches).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}

impl<'a> super::Arguments<'a> for ClusterCommand {}
