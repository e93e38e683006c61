mod loader;
mod overrides;
mod schema;

pub use loader::{load, validate};
pub use overrides::CliOverrides;
pub use schema::{Config, HealthCheckConfig, HostConfig, LoggingConfig, ServerConfig};
