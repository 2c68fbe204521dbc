use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ArgMatches;
use libhvdrain::config::{Profile, ProfileConfig};
use libhvdrain::executor::ssh::SshExecutor;
use libhvdrain::interrupt::InterruptGuard;
use libhvdrain::log::*;
use libhvdrain::notify::{ConsoleNotifier, Notifiers};
use libhvdrain::{DrainContext, RunOptions};
use thiserror::Error;
use tokio::fs;

use crate::cloudstack::CloudStackClient;
use crate::slack::SlackNotifier;

pub mod cluster;
pub mod host;

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Required argument `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config: String,
    pub profile: String,
    pub exec: bool,
    pub force: bool,
}

impl GlobalArgs {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config: matches
                .get_one::<String>("config")
                .cloned()
                .unwrap_or_else(|| "hvdrain.yaml".into()),
            profile: matches
                .get_one::<String>("profile")
                .cloned()
                .unwrap_or_else(|| "default".into()),
            exec: matches.get_flag("exec"),
            force: matches.get_flag("force"),
        }
    }
}

pub struct CliContext<'a> {
    pub globals: GlobalArgs,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(globals: GlobalArgs, matches: &'a ArgMatches) -> Self {
        Self { globals, matches }
    }

    pub async fn load_profile(&self) -> Result<Profile> {
        let contents = fs::read_to_string(&self.globals.config)
            .await
            .with_context(|| format!("Failed reading config file {}", self.globals.config))?;
        parse_profile(&contents, &self.globals.profile)
    }

    /// Wire up the clients for the selected profile. Without `--exec` the
    /// context is dry-run and nothing is changed.
    pub async fn drain_context(&self, threads: usize) -> Result<DrainContext> {
        let profile = self.load_profile().await?;
        let control = CloudStackClient::new(profile.api())?;
        let remote = SshExecutor::from_config(profile.ssh(), profile.api().timeout()).await?;
        let mut notifiers = Notifiers::new().with(Arc::new(ConsoleNotifier));
        if let Some(slack) = profile.slack() {
            notifiers = notifiers.with(Arc::new(SlackNotifier::new(slack)));
        }

        let options = RunOptions {
            dry_run: !self.globals.exec,
            force: self.globals.force,
            threads,
            call_timeout: profile.api().timeout(),
            ..Default::default()
        };
        if options.dry_run {
            progress(1, "dry-run: nothing will be changed, pass --exec to apply");
        }
        if options.force {
            warn!("--force given, cluster safety checks will be bypassed");
        }

        let ctx = DrainContext::new(Arc::new(control), Arc::new(remote), Arc::new(notifiers), options);
        Ok(if self.globals.exec {
            ctx.with_interrupts(InterruptGuard::install())
        } else {
            ctx
        })
    }
}

fn parse_profile(contents: &str, name: &str) -> Result<Profile> {
    let config: ProfileConfig =
        serde_yaml::from_str(contents).context("deserializing profile config")?;
    Ok(config.profile(name)?.clone())
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext) -> Result<()>;
}

pub trait Arguments<'a> {
    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    fn read_argument(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Result<String> {
        self.read_argument_with_validator(arg_matches, id, &mut |_| Ok(()))
    }

    fn read_optional_argument(&self, arg_matches: &'a ArgMatches, id: &'a str) -> Option<String> {
        arg_matches.get_one::<String>(id).cloned()
    }

    /// `--threads`, at least one.
    fn read_threads(&self, arg_matches: &'a ArgMatches) -> Result<usize> {
        let threads = arg_matches.get_one::<usize>("threads").copied().unwrap_or(5);
        if threads == 0 {
            return Err(CommandErrors::InputValidationFailure(
                "threads".into(),
                "at least 1".into(),
            )
            .into());
        }
        Ok(threads)
    }
}
