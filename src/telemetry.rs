//! tracing subscriber setup. Initialized by the binary only; the library
//! never installs a global subscriber.

use tracing_subscriber::EnvFilter;

pub fn init(verbose: u8) {
    let default_directive = match verbose {
        0 => "strata=info",
        1 => "strata=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    // Ignore double-init (tests, embedders with their own subscriber).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
