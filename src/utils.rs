use std::sync::LazyLock;

use indicatif::ProgressStyle;

static STYLE_RUN: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

static STYLE_LEVEL: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("  {spinner:.blue} {msg:12} [{bar:30.yellow/white}] {pos}/{len}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
});

/// Progress style of a whole run, one tick per level.
pub(crate) fn style_run() -> ProgressStyle {
    STYLE_RUN.clone()
}

/// Progress style of a single level, one tick per finished task.
pub(crate) fn style_level() -> ProgressStyle {
    STYLE_LEVEL.clone()
}

/// Installs a global subscriber that prints events to stderr, filtered by
/// `RUST_LOG` (default `info`), and draws the progress bars attached to the
/// executor's spans.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}
