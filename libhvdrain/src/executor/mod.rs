use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod hook;
pub mod ssh;

pub type Logs = Vec<String>;

/// What a remote command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs commands on hypervisors: reboots, liveness probes, bond checks,
/// native migrations and helper uploads.
#[async_trait]
pub trait RemoteExecutor: std::fmt::Debug + Send + Sync {
    async fn run_command(&self, address: &str, command: &str) -> Result<CommandOutput>;

    /// Write `contents` to `path` on the host, replacing what is there.
    async fn upload(&self, address: &str, path: &str, contents: &[u8]) -> Result<()>;

    /// Whether the host accepts TCP connections on its SSH port.
    async fn is_reachable(&self, address: &str) -> bool {
        tcp_reachable(address, crate::config::default_ssh_port()).await
    }
}

pub async fn tcp_reachable(address: &str, port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect((address, port));
    matches!(
        tokio::time::timeout(Duration::from_secs(3), connect).await,
        Ok(Ok(_))
    )
}
