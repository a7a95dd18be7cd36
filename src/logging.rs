//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence; otherwise the supplied default level applies.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if result.is_ok() {
        tracing::debug!(level = default_level, json, "tracing initialised");
    }
}
