//! Structured logging to stderr. `RUST_LOG` wins; otherwise `info`, or
//! `debug` with `--verbose`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "reelgate=debug,info" } else { "info" }
}

pub fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert_eq!(default_directive(false), "info");
        assert!(default_directive(true).contains("reelgate=debug"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init_logging(false);
        init_logging(true);
    }
}
