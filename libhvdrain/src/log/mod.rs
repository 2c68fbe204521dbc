//! Logging for drains and rolling runs: the tracing macros, the level chosen
//! from the command line, operator progress lines and the eyre report hook.
pub use color_eyre::eyre::eyre;
pub use tracing::level_filters::LevelFilter;
pub use tracing::{debug, error, info, span, trace, warn};

/// Max log level for the command line flags. `--debug` wins, then `-v`
/// counts, then `-q`; the default is warnings only, since progress lines
/// already go to stdout.
pub fn max_level(debug: bool, quiet: bool, verbose: u8) -> LevelFilter {
    if debug {
        return LevelFilter::DEBUG;
    }
    match (verbose, quiet) {
        (0, true) => LevelFilter::ERROR,
        (0, false) => LevelFilter::WARN,
        (1, _) => LevelFilter::INFO,
        (2, _) => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Print an operator-facing progress line at the given depth, mirroring it
/// to the log at `info`.
pub fn progress(depth: usize, message: impl AsRef<str>) {
    let message = message.as_ref();
    println!("{}", progress_line(depth, message));
    info!("{}", message);
}

fn progress_line(depth: usize, message: &str) -> String {
    format!("{} {}", "*".repeat(depth.max(1)), message)
}

/// Install color_eyre as the global error handler. Frames from the runtime
/// and from the retry and polling plumbing are hidden from reports.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .issue_url(concat!(env!("CARGO_PKG_REPOSITORY"), "/issues/new"))
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            let hidden = &[
                "tokio::",
                "tracing::",
                "color_eyre::",
                "futures_util::",
                "hvdrain::retry::",
                "hvdrain::poll::",
                "<core::",
            ];
            frames.retain(|frame| match frame.name.as_deref() {
                Some(name) => !hidden.iter().any(|prefix| name.starts_with(prefix)),
                None => true,
            });
        }))
        .install()?;

    Ok(())
}
