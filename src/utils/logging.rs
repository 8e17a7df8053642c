use tracing::level_filters::LevelFilter;

/// Parse a textual log level. Unknown values fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

/// Initialize tracing for the application.
///
/// Output goes to stderr so stdout stays free for prompts and payloads.
/// `verbose` raises the level to at least `debug`, which includes the
/// broker client's own diagnostics.
pub fn init(level: &str, verbose: bool) {
    let mut filter = parse_level(level);
    if verbose && filter < LevelFilter::DEBUG {
        filter = LevelFilter::DEBUG;
    }

    // try_init so tests and libraries can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}
