use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = DrainError> = std::result::Result<T, E>;

/// Everything that can stop a drain, a maintenance transition or a rolling
/// run. Expected empty results (no landing host, nothing resident) are values,
/// not variants here.
#[derive(Error, Debug)]
pub enum DrainError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    #[error("no host in cluster `{cluster}` can take `{workload}` ({required} bytes required)")]
    CapacityExhausted {
        cluster: String,
        workload: String,
        required: u64,
    },

    #[error("control plane call `{call}` failed")]
    Api {
        call: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("migration of `{workload}` off host `{host}` failed: {reason}")]
    MigrationFailed {
        host: String,
        workload: String,
        reason: String,
    },

    #[error("drain of host `{host}` stalled with {remaining} workload(s) still resident")]
    DrainStall { host: String, remaining: usize },

    #[error("host `{host}` failed to reboot: {reason}")]
    RebootFailure { host: String, reason: String },

    #[error("cluster `{cluster}` already has host(s) in maintenance: {}", hosts.join(", "))]
    UnsafeClusterState { cluster: String, hosts: Vec<String> },

    #[error("host `{host}` cannot {action} from state {state}")]
    InvalidTransition {
        host: String,
        action: &'static str,
        state: String,
    },

    #[error("maintenance of host `{host}` was cancelled outside of this run")]
    MaintenanceCancelled { host: String },

    #[error("{stage} hook `{script}` failed for host `{host}`: {reason}")]
    HookFailed {
        stage: &'static str,
        script: String,
        host: String,
        reason: String,
    },

    #[error("bond check on host `{host}` failed: {detail}")]
    BondDegraded { host: String, detail: String },

    #[error("remote command on host `{host}` failed")]
    Remote {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("run interrupted by operator before host `{next_host}`")]
    Interrupted { next_host: String },
}

impl DrainError {
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        DrainError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Wraps a control plane error for the named API call.
    pub fn api(call: &'static str) -> impl FnOnce(anyhow::Error) -> DrainError {
        move |source| DrainError::Api { call, source }
    }

    /// The host this error concerns, if it names one.
    pub fn host(&self) -> Option<&str> {
        match self {
            DrainError::MigrationFailed { host, .. }
            | DrainError::DrainStall { host, .. }
            | DrainError::RebootFailure { host, .. }
            | DrainError::InvalidTransition { host, .. }
            | DrainError::MaintenanceCancelled { host }
            | DrainError::HookFailed { host, .. }
            | DrainError::BondDegraded { host, .. }
            | DrainError::Remote { host, .. } => Some(host),
            DrainError::NotFound { kind: "host", name } => Some(name),
            _ => None,
        }
    }

    /// The line printed for the operator when a run stops on this error.
    pub fn investigate_message(&self) -> String {
        match self.host() {
            Some(host) => format!("{self}. Please investigate manually (host: {host})."),
            None => format!("{self}. Please investigate manually."),
        }
    }
}

/// Marks a control plane failure as worth retrying (timeouts, 5xx, known
/// serialization errors). Control plane implementations wrap their error in
/// this type; the core only checks for its presence in the chain.
#[derive(Error, Debug)]
#[error("transient control plane failure: {0}")]
pub struct TransientApiFailure(pub String);

pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<TransientApiFailure>())
}
