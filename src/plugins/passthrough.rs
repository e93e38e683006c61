use async_trait::async_trait;

use crate::error::Result;
use crate::plugin::{Capabilities, Flow, Metadata, Plugin};

/// Joins both flows and changes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPlugin;

#[async_trait]
impl Plugin for PassthroughPlugin {
    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(Metadata::new("passthrough", env!("CARGO_PKG_VERSION"))
            .with_description("Forwards requests and responses unchanged"))
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities::new([Flow::Request, Flow::Response]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{HttpRequest, HttpResponse};

    #[tokio::test]
    async fn test_passthrough_is_identity() {
        let plugin = PassthroughPlugin;
        let request = HttpRequest::new("POST", "/items")
            .with_header("Content-Type", "application/json")
            .with_body(r#"{"a":1}"#);

        let verdict = plugin.handle_request(request.clone()).await.unwrap();
        assert!(verdict.continue_);
        assert_eq!(verdict.headers, request.headers);
        assert_eq!(verdict.body, request.body);

        let response = HttpResponse::new(201).with_body("created");
        let verdict = plugin.handle_response(response.clone()).await.unwrap();
        assert_eq!(verdict.status_code, Some(201));
        assert_eq!(verdict.body, response.body);
    }
}
