use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

/// Elapsed time since `start`, formatted as a dimmed suffix for log lines.
pub fn as_overhead(start: Instant) -> impl Display {
    let f = format!("(+{}ms)", start.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Spinner style of a single running node.
pub(crate) fn get_style_task() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {span_fields} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
}

/// Style of the overall progress bar of a run.
pub(crate) fn get_style_run() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-")
}

/// Installs the global subscriber: `RUST_LOG`-style filtering, formatted
/// output and progress bars that don't tear the log lines.
#[cfg(feature = "logging")]
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default = if verbose { "kasane=debug" } else { "kasane=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
