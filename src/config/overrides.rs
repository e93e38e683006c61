use figment::providers::Serialized;
use figment::Figment;

use crate::server::listener::Network;

/// Command-line settings that take precedence over file and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub network: Option<Network>,
    pub address: Option<String>,
    /// Force debug logging
    pub debug: bool,
}

impl CliOverrides {
    pub fn is_empty(&self) -> bool {
        self.network.is_none() && self.address.is_none() && !self.debug
    }

    /// Layer the overrides on top of `figment`
    pub fn apply(&self, mut figment: Figment) -> Figment {
        if let Some(network) = self.network {
            figment = figment.merge(Serialized::default("server.network", network));
        }
        if let Some(address) = &self.address {
            figment = figment.merge(Serialized::default("server.address", address));
        }
        if self.debug {
            figment = figment.merge(Serialized::default("logging.level", "debug"));
        }
        figment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_overrides_win() {
        let base = Figment::from(Serialized::defaults(Config::default()));
        let overrides = CliOverrides {
            network: Some(Network::Tcp),
            address: Some("127.0.0.1:7070".to_string()),
            debug: true,
        };

        let config: Config = overrides.apply(base).extract().unwrap();

        assert_eq!(config.server.network, Network::Tcp);
        assert_eq!(config.server.address.as_deref(), Some("127.0.0.1:7070"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_overrides_leave_config_alone() {
        let overrides = CliOverrides::default();
        assert!(overrides.is_empty());

        let config: Config = overrides
            .apply(Figment::from(Serialized::defaults(Config::default())))
            .extract()
            .unwrap();
        assert!(config.server.address.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
