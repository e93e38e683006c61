//! Plugin contract data model
//!
//! Types exchanged between the host and a plugin. Everything here is plain
//! data: payloads are passed by value, and the value a plugin returns replaces
//! the host's working copy.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::PluginError;

/// Mediation point a plugin can participate in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// Before the upstream call
    Request,
    /// After the upstream call
    Response,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Request => write!(f, "request"),
            Flow::Response => write!(f, "response"),
        }
    }
}

/// Identifies a plugin instance to the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Flows a plugin declares. The host wires its pipeline from this once, so
/// it must not change for the lifetime of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub flows: BTreeSet<Flow>,
}

impl Capabilities {
    pub fn new(flows: impl IntoIterator<Item = Flow>) -> Self {
        Self {
            flows: flows.into_iter().collect(),
        }
    }

    pub fn supports(&self, flow: Flow) -> bool {
        self.flows.contains(&flow)
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Opaque plugin options, delivered once via `configure`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Fetch a required, non-empty option
    pub fn require(&self, key: &str) -> Result<&str, PluginError> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            Some(_) => Err(PluginError::Configuration(format!(
                "option '{key}' must not be empty"
            ))),
            None => Err(PluginError::Configuration(format!(
                "missing required option '{key}'"
            ))),
        }
    }
}

impl From<BTreeMap<String, String>> for PluginConfig {
    fn from(options: BTreeMap<String, String>) -> Self {
        Self { options }
    }
}

/// Ordered multi-map of header names to values.
///
/// Names are matched case-insensitively; insertion order and the original
/// casing are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a value, keeping any existing values for the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value for `name` with a single value.
    ///
    /// The new entry takes the position of the first removed one, or goes to
    /// the end if the name was absent.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(pos) => {
                self.0[pos] = (name.clone(), value);
                let mut index = 0;
                self.0.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.0.push((name, value)),
        }
    }

    /// Remove every value for `name`, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An in-flight request as seen by request-flow plugins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64")]
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let path = path_of(&url).to_string();
        Self {
            method: method.into(),
            url,
            path,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Take headers and body from a continuing verdict. The request line is
    /// not part of a verdict and stays as is; the status code is ignored.
    pub fn apply(&mut self, verdict: Verdict) {
        self.headers = verdict.headers;
        self.body = verdict.body;
    }
}

/// A response as seen by response-flow plugins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64")]
    pub body: Bytes,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new(200)
    }
}

impl HttpResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Take status, headers and body from a continuing verdict. An unset
    /// status keeps the current one.
    pub fn apply(&mut self, verdict: Verdict) {
        if let Some(status) = verdict.status_code {
            self.status_code = status;
        }
        self.headers = verdict.headers;
        self.body = verdict.body;
    }
}

/// A plugin's mediation result.
///
/// `continue_ == true` hands the (possibly modified) payload to the next
/// stage. `continue_ == false` short-circuits: the verdict becomes the final
/// response and every remaining stage is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    #[serde(rename = "continue")]
    pub continue_: bool,
    /// `None` is the unset sentinel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "body_base64")]
    pub body: Bytes,
}

impl Verdict {
    /// Continue with the given payload
    pub fn proceed(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            continue_: true,
            status_code: None,
            headers,
            body: body.into(),
        }
    }

    /// Continue with the request unchanged
    pub fn pass_request(request: HttpRequest) -> Self {
        Self::proceed(request.headers, request.body)
    }

    /// Continue with the response unchanged
    pub fn pass_response(response: HttpResponse) -> Self {
        Self {
            continue_: true,
            status_code: Some(response.status_code),
            headers: response.headers,
            body: response.body,
        }
    }

    /// Short-circuit with a final response
    pub fn respond(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            continue_: false,
            status_code: Some(status_code),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn is_short_circuit(&self) -> bool {
        !self.continue_
    }

    /// The final response this verdict describes when it short-circuits
    pub fn into_response(self) -> HttpResponse {
        self.into_response_or(200)
    }

    /// Like `into_response`, with `status_code` used when the verdict sets
    /// none
    pub fn into_response_or(self, status_code: u16) -> HttpResponse {
        HttpResponse {
            status_code: self.status_code.unwrap_or(status_code),
            headers: self.headers,
            body: self.body,
        }
    }
}

fn path_of(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = if url.contains("://") {
        without_scheme
            .find('/')
            .map_or("/", |idx| &without_scheme[idx..])
    } else {
        without_scheme
    };
    path.split(['?', '#']).next().unwrap_or(path)
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        headers.append("X-Trace", "a");
        headers.append("x-trace", "b");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get_all("X-TRACE").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!headers.contains("authorization"));
    }

    #[test]
    fn test_headers_insert_replaces_in_place() {
        let mut headers: Headers = [("A", "1"), ("B", "2"), ("a", "3"), ("C", "4")]
            .into_iter()
            .collect();

        headers.insert("a", "9");

        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(entries, vec![("a", "9"), ("B", "2"), ("C", "4")]);
    }

    #[test]
    fn test_headers_remove() {
        let mut headers: Headers = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        assert_eq!(headers.remove("A"), 2);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.remove("missing"), 0);
    }

    #[test]
    fn test_plugin_config_require() {
        let config = PluginConfig::new()
            .with_option("token", "secret")
            .with_option("empty", "");

        assert_eq!(config.require("token").unwrap(), "secret");
        assert!(matches!(
            config.require("missing"),
            Err(PluginError::Configuration(_))
        ));
        assert!(matches!(
            config.require("empty"),
            Err(PluginError::Configuration(_))
        ));
        assert_eq!(config.get_or("missing", "fallback"), "fallback");
    }

    #[test]
    fn test_request_path_from_url() {
        assert_eq!(HttpRequest::new("GET", "http://svc:8080/a/b?q=1").path, "/a/b");
        assert_eq!(HttpRequest::new("GET", "https://svc").path, "/");
        assert_eq!(HttpRequest::new("GET", "/mcp#frag").path, "/mcp");
    }

    #[test]
    fn test_request_apply_ignores_status() {
        let mut request = HttpRequest::new("POST", "/mcp").with_body("old");
        let verdict = Verdict {
            continue_: true,
            status_code: Some(418),
            headers: [("X", "1")].into_iter().collect(),
            body: Bytes::from_static(b"new"),
        };

        request.apply(verdict);

        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.get("x"), Some("1"));
        assert_eq!(request.body, Bytes::from_static(b"new"));
    }

    #[test]
    fn test_response_apply_keeps_status_when_unset() {
        let mut response = HttpResponse::new(201);
        response.apply(Verdict::proceed(Headers::new(), "body"));
        assert_eq!(response.status_code, 201);

        response.apply(Verdict::pass_response(HttpResponse::new(404)));
        assert_eq!(response.status_code, 404);
    }

    #[test]
    fn test_short_circuit_into_response() {
        let verdict = Verdict::respond(401, "Unauthorized").with_header("WWW-Authenticate", "Bearer");
        assert!(verdict.is_short_circuit());

        let response = verdict.into_response();
        assert_eq!(response.status_code, 401);
        assert_eq!(response.headers.get("www-authenticate"), Some("Bearer"));
        assert_eq!(response.body, Bytes::from_static(b"Unauthorized"));
    }

    #[test]
    fn test_short_circuit_status_fallback() {
        let mut verdict = Verdict::respond(200, "replaced");
        verdict.status_code = None;
        assert_eq!(verdict.clone().into_response_or(404).status_code, 404);
        assert_eq!(verdict.into_response().status_code, 200);

        let explicit = Verdict::respond(451, "");
        assert_eq!(explicit.into_response_or(404).status_code, 451);
    }

    #[test]
    fn test_verdict_json_shape() {
        let verdict = Verdict::proceed([("a", "1")].into_iter().collect(), "hi");
        let json = serde_json::to_value(&verdict).unwrap();

        assert_eq!(json["continue"], true);
        assert!(json.get("statusCode").is_none());
        assert_eq!(json["headers"], serde_json::json!([["a", "1"]]));
        assert_eq!(json["body"], "aGk=");
    }

    #[test]
    fn test_capabilities_deserialization() {
        let caps: Capabilities = serde_json::from_str(r#"{"flows":["response","request"]}"#).unwrap();
        assert!(caps.supports(Flow::Request));
        assert!(caps.supports(Flow::Response));

        let empty: Capabilities = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }
}
