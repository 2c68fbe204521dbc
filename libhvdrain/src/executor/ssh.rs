use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use derive_getters::Getters;

use super::{CommandOutput, RemoteExecutor};
use crate::config::SshConfig;
use crate::log::*;

/// Runs commands on hypervisors over SSH with public key authentication. One
/// session per command; hypervisors drop connections when they reboot.
#[derive(Getters, Debug, Clone)]
pub struct SshExecutor {
    ssh_user: String,
    port: u16,
    #[getter(skip)]
    keypair: Arc<thrussh_keys::key::KeyPair>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(
        ssh_user: String,
        port: u16,
        ssh_key: String,
        ssh_key_passphrase: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let keypair = match ssh_key_passphrase {
            Some(passphrase) => {
                thrussh_keys::decode_secret_key(ssh_key.as_str(), Some(passphrase.trim()))
                    .context("Decoding SSH key with passphrase failed.")
            }
            None => thrussh_keys::decode_secret_key(ssh_key.as_str(), None)
                .context("Decoding SSH key failed."),
        }?;

        Ok(Self {
            ssh_user,
            port,
            keypair: Arc::new(keypair),
            timeout,
        })
    }

    /// Build an executor from a profile's SSH section, reading the key files.
    pub async fn from_config(config: &SshConfig, timeout: Duration) -> Result<Self> {
        let ssh_key = tokio::fs::read_to_string(config.key_path())
            .await
            .with_context(|| format!("Failed reading ssh key file {}", config.key_path()))?;
        let passphrase = match config.key_passphrase_path() {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .context("Failed to read ssh key passphrase")?,
            ),
            None => None,
        };
        Self::new(
            config.user().clone(),
            *config.port(),
            ssh_key,
            passphrase,
            timeout,
        )
    }

    #[tracing::instrument(skip(self))]
    async fn open_channel(&self, address: &str) -> Result<thrussh::client::Channel> {
        let config = Arc::new(thrussh::client::Config::default());
        let addr = format!("{}:{}", address, self.port);
        debug!("connecting to {}", &addr);
        let mut session = thrussh::client::connect(config, addr, SshClient)
            .await
            .with_context(|| format!("connecting to {address}"))?;
        let authenticated = session
            .authenticate_publickey(self.ssh_user.as_str(), self.keypair.clone())
            .await?;
        if !authenticated {
            anyhow::bail!("ssh authentication as {} failed on {}", self.ssh_user, address);
        }
        debug!("authenticated, opening channel on {}", address);
        Ok(session.channel_open_session().await?)
    }

    async fn exec(&self, address: &str, command: &str, input: Option<&[u8]>) -> Result<CommandOutput> {
        let mut channel = self.open_channel(address).await?;
        channel.exec(true, command).await?;
        if let Some(input) = input {
            channel.data(input).await?;
            channel.eof().await?;
        }

        let mut stdout = Vec::new();
        let mut exit_code = None;
        while let Some(frame) = channel.wait().await {
            match frame {
                thrussh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data[..]),
                thrussh::ChannelMsg::ExtendedData { data, ext: _ } => {
                    trace!("stderr from {}: {}", address, String::from_utf8_lossy(&data[..]));
                }
                thrussh::ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                }
                thrussh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code
            .with_context(|| format!("'{command}' on {address} ended without an exit status"))?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[tracing::instrument(skip(self))]
    async fn run_command(&self, address: &str, command: &str) -> Result<CommandOutput> {
        let output = tokio::time::timeout(self.timeout, self.exec(address, command, None))
            .await
            .with_context(|| format!("'{command}' on {address} timed out"))??;
        debug!("'{}' on {} exited {}", command, address, output.exit_code);
        Ok(output)
    }

    #[tracing::instrument(skip(self, contents))]
    async fn upload(&self, address: &str, path: &str, contents: &[u8]) -> Result<()> {
        let command = format!("cat > {}", shell_words::quote(path));
        let output = tokio::time::timeout(self.timeout, self.exec(address, &command, Some(contents)))
            .await
            .with_context(|| format!("uploading {path} to {address} timed out"))??;
        if !output.success() {
            anyhow::bail!("uploading {} to {} exited {}", path, address, output.exit_code);
        }
        Ok(())
    }

    async fn is_reachable(&self, address: &str) -> bool {
        super::tcp_reachable(address, self.port).await
    }
}

struct SshClient;

impl thrussh::client::Handler for SshClient {
    type Error = anyhow::Error;
    type FutureUnit =
        futures::future::Ready<Result<(Self, thrussh::client::Session), anyhow::Error>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), anyhow::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    // Host keys are not pinned; hypervisors get reinstalled.
    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}
