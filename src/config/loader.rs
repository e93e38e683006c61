use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::overrides::CliOverrides;
use super::schema::Config;
use crate::error::ConfigError;
use crate::server::listener::Network;

const ENV_PREFIX: &str = "HTTP_MEDIATOR_";

/// Load configuration: defaults, then the optional file, then
/// `HTTP_MEDIATOR_*` environment variables (`__` separates nested keys), then
/// command-line overrides.
pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> Result<Config, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(path) = path {
        figment = merge_file(figment, path)?;
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
    figment = overrides.apply(figment);

    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let config = apply_env_substitutions(config)?;
    validate(&config)?;

    Ok(config)
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Parse(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(figment.merge(Toml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        Some("yaml") | Some("yml") => Ok(figment.merge(Yaml::file(path))),
        _ => Err(ConfigError::Parse(
            "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
        )),
    }
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if let Some(address) = &config.server.address {
        if address.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.address must not be empty".into(),
            ));
        }
        if config.server.network == Network::Tcp && address.rsplit_once(':').is_none() {
            return Err(ConfigError::Validation(format!(
                "server.address '{address}' must be host:port for tcp"
            )));
        }
    }

    if config.host.stage_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "host.stage_timeout_ms must be greater than 0".into(),
        ));
    }

    if config.host.health_check.enabled && config.host.health_check.interval_seconds == 0 {
        return Err(ConfigError::Validation(
            "host.health_check.interval_seconds must be greater than 0".into(),
        ));
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config, ConfigError> {
    for options in config.host.plugins.values_mut() {
        for value in options.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }
    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}` references
fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

    let mut result = input.to_string();
    for cap in re.captures_iter(input) {
        let reference = &cap[1];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::Validation(format!(
                    "Environment variable '{name}' not found"
                )))
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("HTTP_MEDIATOR_TEST_TOKEN", "test_value");

        let result = substitute_env_vars("Bearer ${HTTP_MEDIATOR_TEST_TOKEN}!").unwrap();
        assert_eq!(result, "Bearer test_value!");

        let result = substitute_env_vars("${HTTP_MEDIATOR_MISSING:-default}").unwrap();
        assert_eq!(result, "default");

        assert!(substitute_env_vars("${HTTP_MEDIATOR_MISSING}").is_err());

        std::env::remove_var("HTTP_MEDIATOR_TEST_TOKEN");
    }

    #[test]
    fn test_load_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
network = "tcp"
address = "127.0.0.1:9443"
grace_period_ms = 2500

[host]
stage_timeout_ms = 750
response_failure_policy = "return-upstream"
unroutable_stage_policy = "fail-closed"

[host.plugins.bearer-auth]
token = "${{HTTP_MEDIATOR_UNSET_TOKEN:-fallback}}"
"#
        )
        .unwrap();

        let config = load(Some(file.path()), &CliOverrides::default()).unwrap();

        assert_eq!(config.server.network, Network::Tcp);
        assert_eq!(config.server.address.as_deref(), Some("127.0.0.1:9443"));
        assert_eq!(config.server.grace_period_ms, 2500);
        assert_eq!(config.host.stage_timeout_ms, 750);
        assert_eq!(
            config.host.response_failure_policy,
            crate::plugin::ResponseFailurePolicy::ReturnUpstream
        );
        assert_eq!(
            config.host.unroutable_stage_policy,
            crate::plugin::UnroutableStagePolicy::FailClosed
        );
        assert_eq!(
            config.host.plugin_config("bearer-auth").get("token"),
            Some("fallback")
        );
        // Untouched sections keep their defaults
        assert!(config.host.health_check.enabled);
    }

    #[test]
    fn test_cli_overrides_beat_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"server": {{"address": "/tmp/from-file.sock"}}}}"#).unwrap();

        let overrides = CliOverrides {
            address: Some("/tmp/from-cli.sock".to_string()),
            ..Default::default()
        };
        let config = load(Some(file.path()), &overrides).unwrap();

        assert_eq!(config.server.address.as_deref(), Some("/tmp/from-cli.sock"));
        assert_eq!(config.server.network, Network::Unix);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        let err = load(Some(file.path()), &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_tcp_address() {
        let mut config = Config::default();
        config.server.network = Network::Tcp;
        config.server.address = Some("localhost".to_string());
        assert!(validate(&config).is_err());

        config.server.address = Some("localhost:8080".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validate_stage_timeout() {
        let mut config = Config::default();
        config.host.stage_timeout_ms = 0;
        assert!(matches!(validate(&config), Err(ConfigError::Validation(_))));
    }
}
