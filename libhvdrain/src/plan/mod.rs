use std::fmt;

use derive_getters::Getters;
use serde::Serialize;

use crate::executor::hook::HookStage;
use crate::hypervisor::RebootAction;
use crate::log::*;
use crate::model::{Cluster, Host, ResourceState};
use crate::rolling::RollingOptions;

/// One thing the rolling controller does to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Step {
    /// Host is on the ignore list and left untouched.
    Ignore,
    Hook { stage: HookStage },
    Drain,
    EnterMaintenance,
    BondCheck,
    Reboot { action: RebootAction },
    WaitForReconnect,
    CancelMaintenance,
}

impl Step {
    pub fn hook(stage: HookStage) -> Self {
        Step::Hook { stage }
    }

    /// Steps that change the host or the cloud when executed.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Step::Ignore | Step::BondCheck | Step::WaitForReconnect)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ignore => write!(f, "ignore (on the ignore list)"),
            Step::Hook { stage } => write!(f, "run {} hook", stage.name()),
            Step::Drain => write!(f, "drain"),
            Step::EnterMaintenance => write!(f, "enter maintenance"),
            Step::BondCheck => write!(f, "check bonds"),
            Step::Reboot { action } => f.write_str(action_name(*action)),
            Step::WaitForReconnect => write!(f, "wait for reconnect"),
            Step::CancelMaintenance => write!(f, "cancel maintenance"),
        }
    }
}

/// A [`Step`] bound to the host it applies to.
#[derive(Getters, Debug, Clone, Serialize)]
pub struct PlannedStep {
    host: String,
    step: Step,
}

/// The ordered steps of a rolling run across a cluster. Hosts appear in the
/// order they are handled, poolmaster first.
#[derive(Getters, Debug, Clone, Serialize)]
pub struct RollingPlan {
    name: String,
    blueprint: Vec<PlannedStep>,
}

impl RollingPlan {
    pub fn new(cluster: &Cluster, hosts: &[Host], options: &RollingOptions) -> Self {
        let mut blueprint = vec![];
        for host in hosts {
            for step in steps_for(cluster, host, options) {
                blueprint.push(PlannedStep {
                    host: host.name.clone(),
                    step,
                });
            }
        }
        debug!("plan: {} step(s) for {} host(s)", blueprint.len(), hosts.len());
        Self {
            name: format!("rolling {} of {}", action_name(options.reboot), cluster.name),
            blueprint,
        }
    }

    /// The subset of this plan that applies to `host`. Does not consume the
    /// plan.
    pub fn plan_for_host(&self, host: &str) -> RollingPlan {
        RollingPlan {
            name: self.name.clone(),
            blueprint: self
                .blueprint
                .iter()
                .filter(|s| s.host == host)
                .cloned()
                .collect(),
        }
    }

    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.blueprint.iter().map(|s| s.step)
    }

    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = vec![];
        for step in &self.blueprint {
            if hosts.last() != Some(&step.host.as_str()) {
                hosts.push(&step.host);
            }
        }
        hosts
    }

    pub fn print(&self) {
        println!("*** plan: {} ***", self.name);
        for host in self.hosts() {
            println!("** {}", host);
            for step in self.plan_for_host(host).steps() {
                println!("*   {}", step);
            }
        }
    }
}

fn action_name(action: RebootAction) -> &'static str {
    match action {
        RebootAction::Reboot => "reboot",
        RebootAction::Halt => "halt",
        RebootAction::ForceReset => "force-reset",
        RebootAction::Skip => "maintenance",
    }
}

fn steps_for(cluster: &Cluster, host: &Host, options: &RollingOptions) -> Vec<Step> {
    if options.ignore_hosts.contains(&host.name) {
        return vec![Step::Ignore];
    }

    let mut steps = vec![];
    let hooks = &options.hooks;
    if hooks.for_stage(HookStage::PreDrain).is_some() {
        steps.push(Step::hook(HookStage::PreDrain));
    }
    if host.resource_state != ResourceState::Maintenance {
        steps.push(Step::Drain);
        steps.push(Step::EnterMaintenance);
    }
    if hooks.for_stage(HookStage::PostDrain).is_some() {
        steps.push(Step::hook(HookStage::PostDrain));
    }
    if options.reboot.takes_host_down() {
        if options.bond_check && cluster.hypervisor.bond_status_command().is_some() {
            steps.push(Step::BondCheck);
        }
        steps.push(Step::Reboot {
            action: options.reboot,
        });
        steps.push(Step::WaitForReconnect);
    }
    if hooks.for_stage(HookStage::PostReboot).is_some() {
        steps.push(Step::hook(HookStage::PostReboot));
    }
    steps.push(Step::CancelMaintenance);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::hook::Hooks;
    use crate::fake;
    use crate::model::Hypervisor;

    #[test]
    fn test_plan_covers_each_host_in_order() {
        let cluster = fake::cluster(Hypervisor::Kvm);
        let mut b = fake::host("b", 8, 0);
        b.resource_state = ResourceState::Maintenance;
        let hosts = vec![fake::host("a", 8, 0), b, fake::host("c", 8, 0)];
        let options = RollingOptions {
            ignore_hosts: vec!["host-c".into()],
            hooks: Hooks::new(Some("/bin/true".into()), None, None),
            ..Default::default()
        };

        let plan = RollingPlan::new(&cluster, &hosts, &options);
        assert_eq!(vec!["host-a", "host-b", "host-c"], plan.hosts());
        assert_eq!(
            vec![
                Step::hook(HookStage::PreDrain),
                Step::Drain,
                Step::EnterMaintenance,
                Step::BondCheck,
                Step::Reboot {
                    action: RebootAction::Reboot
                },
                Step::WaitForReconnect,
                Step::CancelMaintenance,
            ],
            plan.plan_for_host("host-a").steps().collect::<Vec<_>>()
        );
        assert!(!plan.plan_for_host("host-b").steps().any(|s| s == Step::Drain));
        assert_eq!(vec![Step::Ignore], plan.plan_for_host("host-c").steps().collect::<Vec<_>>());
    }

    #[test]
    fn test_skip_reboot_has_no_reconnect_wait() {
        let cluster = fake::cluster(Hypervisor::VMware);
        let options = RollingOptions {
            reboot: RebootAction::Skip,
            ..Default::default()
        };
        let plan = RollingPlan::new(&cluster, &[fake::host("a", 8, 0)], &options);
        assert_eq!(
            vec![Step::Drain, Step::EnterMaintenance, Step::CancelMaintenance],
            plan.steps().collect::<Vec<_>>()
        );
        assert_eq!("rolling maintenance of cluster1", plan.name());
    }
}
