#![forbid(unsafe_code)]

use anyhow::Result;
use clap::{command, value_parser, Arg, ArgAction, ArgGroup, ArgMatches};
use libhvdrain::DrainError;
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::Command;

mod cloudstack;
mod commands;
mod slack;

use libhvdrain::log::*;

fn threads_arg() -> Arg {
    Arg::new("threads")
        .help("Migrations to run at once while draining a host.")
        .short('t')
        .long("threads")
        .default_value("5")
        .value_parser(value_parser!(usize))
}

fn cli() -> clap::Command {
    command!()
        .arg(
            Arg::new("config")
                .help("Path to the profile config file.")
                .short('c')
                .long("config")
                .global(true)
                .default_value("hvdrain.yaml"),
        )
        .arg(
            Arg::new("profile")
                .help("Profile in the config file to use.")
                .long("profile")
                .global(true)
                .default_value("default"),
        )
        .arg(
            Arg::new("exec")
                .help("Actually make changes. Without this every command is a dry-run.")
                .long("exec")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("force")
                .help("Bypass the one-host-in-maintenance safety check.")
                .long("force")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .help("Log at debug level, including every API call.")
                .long("debug")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Turn debugging information on. Overrides -q. Can specify up to -vvv.")
                .global(true)
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Silence all output. Overridden by -v.")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            command!("cluster")
                .about("Operate on a whole cluster.")
                .subcommand(
                    command!("rolling-reboot")
                        .about("Drain, maintain and reboot every host of a cluster, one at a time.")
                        .arg(
                            Arg::new("cluster")
                                .help("Cluster name.")
                                .long("cluster")
                                .required(true),
                        )
                        .arg(
                            Arg::new("ignore-hosts")
                                .help("Comma separated host names to leave alone.")
                                .long("ignore-hosts")
                                .value_delimiter(','),
                        )
                        .arg(
                            Arg::new("halt")
                                .help("Power hosts off instead of rebooting them.")
                                .long("halt")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(
                            Arg::new("force-reset")
                                .help("Reset hosts through sysrq instead of a clean reboot.")
                                .long("force-reset")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(
                            Arg::new("skip-reboot")
                                .help("Only put each host through maintenance.")
                                .long("skip-reboot")
                                .action(ArgAction::SetTrue),
                        )
                        .group(
                            ArgGroup::new("reboot-action")
                                .args(["halt", "force-reset", "skip-reboot"])
                                .multiple(false),
                        )
                        .arg(
                            Arg::new("pre-script")
                                .help("Script run before each host is drained.")
                                .long("pre-script"),
                        )
                        .arg(
                            Arg::new("post-script")
                                .help("Script run after each host is drained.")
                                .long("post-script"),
                        )
                        .arg(
                            Arg::new("post-reboot-script")
                                .help("Script run once each host is back.")
                                .long("post-reboot-script"),
                        )
                        .arg(
                            Arg::new("no-bond-check")
                                .help("Skip the network bond check before rebooting.")
                                .long("no-bond-check")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(
                            Arg::new("disable-allocation")
                                .help("Disable allocation on the cluster for the duration of the run.")
                                .long("disable-allocation")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(threads_arg()),
                )
                .subcommand(
                    command!("status")
                        .about("Show the hosts of a cluster.")
                        .arg(
                            Arg::new("cluster")
                                .help("Cluster name.")
                                .long("cluster")
                                .required(true),
                        ),
                )
                .subcommand_required(true),
        )
        .subcommand(
            command!("host")
                .about("Operate on a single host.")
                .subcommand(
                    command!("empty")
                        .about("Migrate every workload off a host.")
                        .arg(Arg::new("host").help("Host name.").long("host").required(true))
                        .arg(threads_arg()),
                )
                .subcommand(
                    command!("maintenance")
                        .about("Put a host in maintenance, or take it out with --cancel.")
                        .arg(Arg::new("host").help("Host name.").long("host").required(true))
                        .arg(
                            Arg::new("cancel")
                                .help("Cancel maintenance instead.")
                                .long("cancel")
                                .action(ArgAction::SetTrue),
                        )
                        .arg(threads_arg()),
                )
                .subcommand_required(true),
        )
        .subcommand_required(true)
}

fn init_logging(matches: &ArgMatches) {
    let logging_config = tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::new(
            time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        ))
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .compact();

    let level = max_level(
        matches.get_flag("debug"),
        matches.get_flag("quiet"),
        matches.get_count("verbose"),
    );
    let subscriber = logging_config.with_max_level(level).finish();
    subscriber.init();
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let globals = commands::GlobalArgs::from_matches(matches);
    if let Some((subcommand, matches)) = matches.subcommand() {
        let ctx = commands::CliContext::new(globals, matches);
        debug!(
            "matched subcommand {} with matches: {:?}",
            &subcommand,
            &matches.ids().map(|id| id.as_str()).collect::<Vec<_>>()
        );
        match subcommand {
            "cluster" => commands::cluster::ClusterCommand::new().run(&ctx).await?,
            "host" => commands::host::HostCommand::new().run(&ctx).await?,
            _ => return Err(anyhow::anyhow!("Unrecognized subcommand: {}", subcommand)),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    install_color_eyre()?;
    let matches = cli().get_matches();
    init_logging(&matches);

    if let Err(err) = run(&matches).await {
        match err.downcast_ref::<DrainError>() {
            Some(drain) => {
                error!("{:#}", err);
                eprintln!("! {}", drain.investigate_message());
            }
            None => eprintln!("! {:#}", err),
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn test_rolling_reboot_args() {
        let matches = cli()
            .try_get_matches_from([
                "hvdrain",
                "--exec",
                "cluster",
                "rolling-reboot",
                "--cluster",
                "cluster1",
                "--ignore-hosts",
                "hv01,hv02",
                "--halt",
                "--threads",
                "2",
            ])
            .unwrap();
        let globals = commands::GlobalArgs::from_matches(&matches);
        assert!(globals.exec);
        assert!(!globals.force);
        assert_eq!("default", globals.profile);

        let (_, cluster) = matches.subcommand().unwrap();
        let (_, rolling) = cluster.subcommand().unwrap();
        let ignored: Vec<&String> = rolling.get_many::<String>("ignore-hosts").unwrap().collect();
        assert_eq!(vec!["hv01", "hv02"], ignored);
        assert_eq!(Some(&2), rolling.get_one::<usize>("threads"));
    }

    #[test]
    fn test_reboot_actions_are_exclusive() {
        let result = cli().try_get_matches_from([
            "hvdrain",
            "cluster",
            "rolling-reboot",
            "--cluster",
            "c",
            "--halt",
            "--skip-reboot",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let matches = cli()
            .try_get_matches_from(["hvdrain", "host", "empty", "--host", "hv01", "--exec", "--profile", "lab"])
            .unwrap();
        let globals = commands::GlobalArgs::from_matches(&matches);
        assert!(globals.exec);
        assert_eq!("lab", globals.profile);
    }
}
