use std::collections::HashMap;
use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::error::{DrainError, Result};

pub type Port = u16;

pub fn default_ssh_port() -> Port {
    22
}

pub fn default_ssh_user() -> String {
    "root".into()
}

pub fn default_api_timeout_secs() -> u64 {
    900
}

/// A profile file: named connection settings, selected with `--profile`.
#[derive(Getters, Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    profiles: HashMap<String, Profile>,
}

impl ProfileConfig {
    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| DrainError::not_found("profile", name))
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    api: ApiConfig,
    ssh: SshConfig,
    #[serde(default)]
    slack: Option<SlackConfig>,
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    url: String,
    api_key: String,
    secret_key: String,
    #[serde(default = "self::default_api_timeout_secs")]
    timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "self::default_ssh_user")]
    user: String,
    #[serde(default = "self::default_ssh_port")]
    port: Port,
    key_path: String,
    #[serde(default)]
    key_passphrase_path: Option<String>,
}

impl SshConfig {
    pub fn new<S: Into<String>>(user: S, key_path: S) -> Self {
        Self {
            user: user.into(),
            port: default_ssh_port(),
            key_path: key_path.into(),
            key_passphrase_path: None,
        }
    }

    pub fn new_with_port<S: Into<String>>(user: S, port: Port, key_path: S) -> Self {
        Self {
            user: user.into(),
            port,
            key_path: key_path.into(),
            key_passphrase_path: None,
        }
    }
}

#[derive(Getters, Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    webhook_url: String,
    #[serde(default)]
    channel: Option<String>,
}
