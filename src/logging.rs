use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` directives are honoured; the
/// configured level applies to this crate. Safe to call more than once.
pub fn init(config: &LoggingConfig) {
    let filter = match format!("http_mediator={}", config.level).parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed (tests, embedding hosts)
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
