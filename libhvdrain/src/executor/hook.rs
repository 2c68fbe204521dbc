use std::process::Stdio;

use derive_getters::Getters;
use serde::Serialize;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};

use super::Logs;
use crate::error::{DrainError, Result};
use crate::log::*;
use crate::model::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookStage {
    PreDrain,
    PostDrain,
    PostReboot,
}

impl HookStage {
    pub fn name(&self) -> &'static str {
        match self {
            HookStage::PreDrain => "pre-drain",
            HookStage::PostDrain => "post-drain",
            HookStage::PostReboot => "post-reboot",
        }
    }
}

/// Operator scripts run on the machine driving the run, around each host's
/// drain and reboot.
#[derive(Getters, Debug, Clone, Default)]
pub struct Hooks {
    pre_drain: Option<String>,
    post_drain: Option<String>,
    post_reboot: Option<String>,
}

impl Hooks {
    pub fn new(
        pre_drain: Option<String>,
        post_drain: Option<String>,
        post_reboot: Option<String>,
    ) -> Self {
        Self {
            pre_drain,
            post_drain,
            post_reboot,
        }
    }

    pub fn for_stage(&self, stage: HookStage) -> Option<&str> {
        match stage {
            HookStage::PreDrain => self.pre_drain.as_deref(),
            HookStage::PostDrain => self.post_drain.as_deref(),
            HookStage::PostReboot => self.post_reboot.as_deref(),
        }
    }
}

/// Runs a hook script locally, streaming its output to the log. The script
/// gets the host name and address appended to its arguments.
#[derive(Getters, Debug, Clone)]
pub struct HookRunner {
    dry_run: bool,
    hooks_run: u32,
}

impl HookRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            hooks_run: 0,
        }
    }

    #[tracing::instrument(skip(self, host), fields(host = %host.name))]
    pub async fn run(&mut self, stage: HookStage, script: &str, host: &Host) -> Result<Logs> {
        let failed = |reason: String| DrainError::HookFailed {
            stage: stage.name(),
            script: script.to_string(),
            host: host.name.clone(),
            reason,
        };

        let mut argv = shell_words::split(script).map_err(|e| failed(e.to_string()))?;
        if argv.is_empty() {
            return Err(failed("empty command".into()));
        }
        let program = which::which(&argv[0]).map_err(|e| failed(format!("{}: {e}", argv[0])))?;
        argv.push(host.name.clone());
        argv.push(host.address.clone());

        if self.dry_run {
            progress(3, format!("would run {} hook: {}", stage.name(), argv.join(" ")));
            return Ok(vec![]);
        }

        progress(3, format!("running {} hook: {}", stage.name(), argv.join(" ")));
        let mut child = Command::new(&program)
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("spawning failed: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed("no stdout handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| failed("no stderr handle".into()))?;
        let mut output = FramedRead::new(stdout, LinesCodec::new())
            .merge(FramedRead::new(stderr, LinesCodec::new()));

        let mut logs = vec![];
        while let Some(line) = output.next().await {
            match line {
                Ok(line) => {
                    println!("    {}", line);
                    debug!("{} hook: {}", stage.name(), line);
                    logs.push(line);
                }
                Err(err) => warn!("error reading {} hook output: {}", stage.name(), err),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| failed(format!("waiting failed: {e}")))?;
        if !status.success() {
            return Err(failed(format!("exited with {status}")));
        }

        info!("{} hook finished for {}", stage.name(), host.name);
        self.hooks_run += 1;
        Ok(logs)
    }
}
