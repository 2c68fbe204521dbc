use anyhow::Result;
use async_trait::async_trait;
use clap::ArgMatches;
use libhvdrain::drain::HostDrainCoordinator;
use libhvdrain::error::DrainError;
use libhvdrain::inventory::ClusterInventory;
use libhvdrain::log::*;
use libhvdrain::maintenance::{MaintenanceOutcome, MaintenanceStateMachine};
use libhvdrain::model::{DrainResult, Outcome};

use super::Arguments;

pub struct HostCommand;

impl HostCommand {
    async fn subcommand_empty<'a>(
        &self,
        context: &'a super::CliContext<'a>,
        matches: &ArgMatches,
    ) -> Result<()> {
        let name = self.read_argument(matches, "host")?;
        let threads = self.read_threads(matches)?;
        let ctx = context.drain_context(threads).await?;
        let host = ClusterInventory::new(ctx.clone()).host(&name).await?;

        let result = HostDrainCoordinator::new(ctx).drain_with_retries(&host).await?;
        print_drain(&result);
        Ok(())
    }

    async fn subcommand_maintenance<'a>(
        &self,
        context: &'a super::CliContext<'a>,
        matches: &ArgMatches,
    ) -> Result<()> {
        let name = self.read_argument(matches, "host")?;
        let ctx = context.drain_context(self.read_threads(matches)?).await?;
        let inventory = ClusterInventory::new(ctx.clone());
        let host = inventory.host(&name).await?;
        let machine = MaintenanceStateMachine::new(ctx);

        let outcome = if matches.get_flag("cancel") {
            machine.cancel_maintenance(&host).await?
        } else {
            machine.enter_maintenance(&host).await?
        };
        match outcome {
            MaintenanceOutcome::ErrorInMaintenance(reason) => {
                error!("{} ended in ErrorInMaintenance: {}", host.name, reason);
                let remaining = inventory.resident_count(&host).await?;
                Err(DrainError::DrainStall {
                    host: host.name.clone(),
                    remaining,
                }
                .into())
            }
            MaintenanceOutcome::Enabled if !matches.get_flag("cancel") => {
                Err(DrainError::MaintenanceCancelled { host: host.name }.into())
            }
            outcome => {
                println!("* {}: {:?}", host.name, outcome);
                Ok(())
            }
        }
    }
}

fn print_drain(result: &DrainResult) {
    println!(
        "*** drain of {}: {} workload(s) handled, {} remaining ({:?}) ***",
        result.host_name, result.attempted, result.remaining, result.elapsed
    );
    for job in &result.jobs {
        let outcome = match job.outcome() {
            Outcome::Migrated => format!(
                "migrated to {}",
                job.destination.as_deref().unwrap_or("<control plane choice>")
            ),
            Outcome::Skipped(reason) => format!("skipped: {}", reason),
            Outcome::Failed(reason) => format!("failed: {}", reason),
        };
        println!("** {} {}: {}", job.kind, job.workload_name, outcome);
    }
}

#[async_trait]
impl<'a> super::Command<'a> for HostCommand {
    fn new() -> Self
    where
        Self: Sized,
    {
        Self {}
    }

    async fn run(&self, context: &'a super::CliContext) -> Result<()> {
        match context.matches.subcommand() {
            Some(("empty", matches)) => {
                self.subcommand_empty(context, matches).await?;
            }
            Some(("maintenance", matches)) => {
                self.subcommand_maintenance(context, matches).await?;
            }
            Some((name, _)) => {
                return Err(super::CommandErrors::InvalidSubcommand(name.to_string()).into())
            }
            None => return Err(super::CommandErrors::NoSubcommandProvided.into()),
        }
        Ok(())
    }
}

impl<'a> super::Arguments<'a> for HostCommand {}
