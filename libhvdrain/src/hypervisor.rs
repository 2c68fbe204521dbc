//! Shell commands for hypervisor-native operations, per hypervisor kind.

use serde::{Deserialize, Serialize};

use crate::model::{Host, Hypervisor, Workload};

pub const HA_STATUS_HELPER: &str = "/tmp/hvdrain-ha-status.sh";

const XEN_HA_STATUS: &str = r#"#!/bin/sh
pool=$(xe pool-list --minimal)
[ "$(xe pool-param-get uuid="$pool" param-name=ha-enabled)" = true ] || exit 0
statefile=$(xe pool-param-get uuid="$pool" param-name=ha-statefiles)
xe vdi-param-get uuid="$statefile" param-name=sr-uuid
"#;

/// How a host is taken down once it is in maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebootAction {
    #[default]
    Reboot,
    /// Power off; an operator powers it back on.
    Halt,
    /// Immediate reset through sysrq, for hosts that hang on shutdown.
    ForceReset,
    /// Leave the host running; an operator does whatever is needed.
    Skip,
}

impl RebootAction {
    pub fn needs_operator(&self) -> bool {
        matches!(self, RebootAction::Halt | RebootAction::Skip)
    }

    pub fn takes_host_down(&self) -> bool {
        !matches!(self, RebootAction::Skip)
    }
}

impl Hypervisor {
    pub fn action_command(&self, action: RebootAction) -> Option<&'static str> {
        match action {
            RebootAction::Reboot => Some("sync; nohup shutdown -r now >/dev/null 2>&1 &"),
            RebootAction::Halt => Some("sync; nohup shutdown -h now >/dev/null 2>&1 &"),
            RebootAction::ForceReset => Some(
                "sync; echo 1 > /proc/sys/kernel/sysrq; nohup sh -c 'sleep 1; echo b > /proc/sysrq-trigger' >/dev/null 2>&1 &",
            ),
            RebootAction::Skip => None,
        }
    }

    /// A command that only succeeds once the hypervisor stack is back.
    pub fn liveness_command(&self) -> &'static str {
        match self {
            Hypervisor::XenServer => "xe host-list params=uuid --minimal",
            Hypervisor::Kvm => "virsh list --all",
            Hypervisor::VMware => "esxcli system version get",
        }
    }

    pub fn bond_status_command(&self) -> Option<&'static str> {
        match self {
            Hypervisor::XenServer => Some("ovs-appctl bond/show"),
            Hypervisor::Kvm => Some("cat /proc/net/bonding/*"),
            Hypervisor::VMware => None,
        }
    }

    /// Live-migrate a workload with the hypervisor's own tooling, bypassing
    /// the control plane.
    pub fn native_migrate_command(&self, workload: &Workload, dest: &Host) -> Option<String> {
        match self {
            Hypervisor::XenServer => Some(format!(
                "xe vm-migrate vm={} host={} live=true",
                workload.instance_name, dest.name
            )),
            Hypervisor::Kvm => Some(format!(
                "virsh migrate --live --persistent --undefinesource {} qemu+tcp://{}/system",
                workload.instance_name, dest.address
            )),
            Hypervisor::VMware => None,
        }
    }

    pub fn poolmaster_uuid_command(&self) -> Option<&'static str> {
        match self {
            Hypervisor::XenServer => Some("xe pool-list params=master --minimal"),
            _ => None,
        }
    }

    pub fn host_name_command(&self, uuid: &str) -> Option<String> {
        match self {
            Hypervisor::XenServer => Some(format!(
                "xe host-param-get uuid={} param-name=name-label",
                uuid.trim()
            )),
            _ => None,
        }
    }

    /// Helper script uploaded to [`HA_STATUS_HELPER`] before asking for
    /// the pool HA status.
    pub fn ha_status_helper(&self) -> Option<&'static str> {
        match self {
            Hypervisor::XenServer => Some(XEN_HA_STATUS),
            _ => None,
        }
    }

    /// Prints the heartbeat SR when pool HA is on, nothing when it is off.
    pub fn ha_status_command(&self) -> Option<String> {
        self.ha_status_helper()
            .map(|_| format!("sh {HA_STATUS_HELPER}"))
    }

    pub fn ha_disable_command(&self) -> Option<&'static str> {
        match self {
            Hypervisor::XenServer => Some("xe pool-ha-disable"),
            _ => None,
        }
    }

    pub fn ha_enable_command(&self, heartbeat_sr: &str) -> Option<String> {
        match self {
            Hypervisor::XenServer => Some(format!(
                "xe pool-ha-enable heartbeat-sr-uuids={}",
                heartbeat_sr.trim()
            )),
            _ => None,
        }
    }
}

/// Look for down links in `/proc/net/bonding` or `ovs-appctl bond/show`
/// output. Returns the offending lines.
pub fn degraded_bond_links(output: &str) -> Vec<String> {
    let mut current = None;
    let mut degraded = vec![];
    for line in output.lines().map(str::trim) {
        if let Some(slave) = line
            .strip_prefix("Slave Interface:")
            .or_else(|| line.strip_prefix("---- "))
        {
            current = Some(slave.trim().trim_end_matches(" ----").to_string());
        }
        let down = line == "MII Status: down"
            || ((line.starts_with("slave ") || line.starts_with("member "))
                && line.ends_with(": disabled"));
        if down {
            degraded.push(match &current {
                Some(iface) if !line.contains(iface.as_str()) => format!("{iface}: {line}"),
                _ => line.to_string(),
            });
        }
    }
    degraded
}
