use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber. `RUST_LOG` overrides `verbosity`.
///
/// 0 = warnings and errors, 1 = info for skywire, 2+ = debug for skywire.
/// Returns `false` when a global subscriber was already installed.
pub fn init_logging(verbosity: u8) -> bool {
    let filter = match verbosity {
        0 => "warn",
        1 => "warn,skywire=info",
        _ => "info,skywire=debug",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr)
        .with_target(true)
        .with_level(true)
        .compact()
        .try_init()
        .is_ok()
}
