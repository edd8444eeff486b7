//! Logging setup for the `alternate` binary.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "info,alternate=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    // a subscriber may already be installed when embedded in tests
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
