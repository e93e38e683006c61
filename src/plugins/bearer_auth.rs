//! Rejects requests that lack the configured bearer token
//!
//! Options:
//! - `token` (required): accepted bearer token
//! - `realm`: realm reported in `WWW-Authenticate` (default `http-mediator`)
//! - `strip`: `true` to remove the `Authorization` header before forwarding

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{HealthError, PluginError, Result};
use crate::plugin::{
    Capabilities, Flow, HttpRequest, Metadata, Plugin, PluginConfig, Verdict,
};

const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone)]
struct Settings {
    token: String,
    realm: String,
    strip: bool,
}

#[derive(Debug, Default)]
pub struct BearerAuthPlugin {
    settings: RwLock<Option<Settings>>,
}

impl BearerAuthPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(PluginError::Configuration(format!(
            "option '{key}' must be a boolean, got '{other}'"
        ))),
    }
}

/// Compares in constant time for equal-length inputs
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(request: &HttpRequest) -> Option<&str> {
    let value = request.headers.get(AUTHORIZATION)?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

#[async_trait]
impl Plugin for BearerAuthPlugin {
    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(Metadata::new("bearer-auth", env!("CARGO_PKG_VERSION"))
            .with_description("Requires a bearer token on every request"))
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities::new([Flow::Request]))
    }

    async fn configure(&self, config: PluginConfig) -> Result<()> {
        let token = config.require("token")?.to_string();
        let realm = config.get_or("realm", "http-mediator").to_string();
        let strip = match config.get("strip") {
            Some(value) => parse_bool("strip", value)?,
            None => false,
        };

        info!(realm = %realm, strip, "bearer-auth configured");
        *self.settings.write().await = Some(Settings {
            token,
            realm,
            strip,
        });
        Ok(())
    }

    async fn check_ready(&self) -> Result<()> {
        if self.settings.read().await.is_some() {
            Ok(())
        } else {
            Err(HealthError::NotReady("no token configured".to_string()).into())
        }
    }

    async fn handle_request(&self, mut request: HttpRequest) -> Result<Verdict> {
        let guard = self.settings.read().await;
        let settings = guard
            .as_ref()
            .ok_or_else(|| PluginError::Mediation("bearer-auth is not configured".to_string()))?;

        let authorized = bearer_token(&request)
            .map(|token| tokens_match(token, &settings.token))
            .unwrap_or(false);

        if !authorized {
            debug!(path = %request.path, "Rejecting unauthenticated request");
            return Ok(Verdict::respond(401, "unauthorized")
                .with_header(
                    "WWW-Authenticate",
                    format!("Bearer realm=\"{}\"", settings.realm),
                )
                .with_header("Content-Type", "text/plain; charset=utf-8"));
        }

        if settings.strip {
            request.headers.remove(AUTHORIZATION);
        }
        Ok(Verdict::pass_request(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn configured(strip: bool) -> BearerAuthPlugin {
        let plugin = BearerAuthPlugin::new();
        plugin
            .configure(
                PluginConfig::new()
                    .with_option("token", "s3cret")
                    .with_option("strip", strip.to_string()),
            )
            .await
            .unwrap();
        plugin
    }

    #[tokio::test]
    async fn test_missing_token_option_rejected() {
        let plugin = BearerAuthPlugin::new();
        let result = plugin.configure(PluginConfig::new()).await;

        assert!(matches!(result, Err(PluginError::Configuration(_))));
        assert!(matches!(
            plugin.check_ready().await,
            Err(PluginError::Health(HealthError::NotReady(_)))
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_request_short_circuits() {
        let plugin = configured(false).await;

        for request in [
            HttpRequest::new("GET", "/private"),
            HttpRequest::new("GET", "/private").with_header("Authorization", "Bearer wrong"),
            HttpRequest::new("GET", "/private").with_header("Authorization", "Basic s3cret"),
        ] {
            let verdict = plugin.handle_request(request).await.unwrap();
            assert!(verdict.is_short_circuit());
            assert_eq!(verdict.status_code, Some(401));
            assert_eq!(
                verdict.headers.get("www-authenticate"),
                Some("Bearer realm=\"http-mediator\"")
            );
        }
    }

    #[tokio::test]
    async fn test_authorized_request_continues() {
        let plugin = configured(false).await;
        let request =
            HttpRequest::new("GET", "/private").with_header("authorization", "bearer s3cret");

        let verdict = plugin.handle_request(request).await.unwrap();
        assert!(verdict.continue_);
        assert!(verdict.headers.contains("Authorization"));
        plugin.check_ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_strip_removes_credentials() {
        let plugin = configured(true).await;
        let request =
            HttpRequest::new("GET", "/private").with_header("Authorization", "Bearer s3cret");

        let verdict = plugin.handle_request(request).await.unwrap();
        assert!(verdict.continue_);
        assert!(!verdict.headers.contains("Authorization"));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
    }
}
