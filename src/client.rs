//! FreeIPA JSON-RPC client.
//!
//! Only the host methods the provider needs are exposed, behind the
//! [`HostApi`] trait so the lifecycle callbacks can run against any
//! implementation (see [`crate::testing::InMemoryHostApi`]).
//!
//! Endpoints:
//! - POST `https://<host>/ipa/session/login_password` (form `user`, `password`)
//! - POST `https://<host>/ipa/session/json` (`{"method", "params": [args, options], "id"}`)
//!
//! The session cookie returned by the login endpoint is kept in the HTTP
//! client's cookie store. Login happens lazily before the first call and once
//! more whenever a call is rejected with `401 Unauthorized`.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use reqwest::header::{ACCEPT, REFERER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// JSON-RPC API version sent with every call.
pub const API_VERSION: &str = "2.229";

/// FreeIPA error code for a missing entry.
pub const NOT_FOUND_CODE: i64 = 4001;

/// Errors raised while talking to FreeIPA.
#[derive(Debug, Error)]
pub enum IpaError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Password login was rejected.
    #[error("Login failed with status {status}")]
    Login {
        /// Status returned by the login endpoint.
        status: StatusCode,
    },

    /// The JSON-RPC endpoint answered with a non-success HTTP status.
    #[error("Unexpected HTTP status {status}: {body}")]
    Status {
        /// The HTTP status.
        status: StatusCode,
        /// The response body.
        body: String,
    },

    /// FreeIPA reported an error for the call.
    #[error("{name} ({code}): {message}")]
    Api {
        /// Numeric FreeIPA error code, e.g. 4001.
        code: i64,
        /// Error class name, e.g. `NotFound`.
        name: String,
        /// Human-readable message.
        message: String,
    },

    /// A request or response payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The response was well-formed JSON but not a JSON-RPC result.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl IpaError {
    /// The error FreeIPA returns for a host that does not exist.
    pub fn not_found(fqdn: &str) -> Self {
        Self::Api {
            code: NOT_FOUND_CODE,
            name: "NotFound".to_string(),
            message: format!("{}: host not found", fqdn),
        }
    }
}

/// Optional arguments for `host_add`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostAddOptions {
    /// Host description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ask the server to generate a one-time password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random: Option<bool>,
    /// Skip the DNS resolvability check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force: Option<bool>,
    /// Explicit one-time password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userpassword: Option<String>,
}

/// Optional arguments for `host_mod`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostModOptions {
    /// Host description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ask the server to generate a new one-time password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random: Option<bool>,
    /// Explicit one-time password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userpassword: Option<String>,
}

/// Result of `host_add` and `host_mod`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostWriteResult {
    /// Generated password, present only when `random` was requested.
    pub randompassword: Option<String>,
}

/// Host attributes returned by `host_show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRecord {
    /// The host's FQDN.
    pub fqdn: Option<String>,
    /// Host description, absent when unset.
    pub description: Option<String>,
    /// One-time password, when the server discloses it.
    pub userpassword: Option<String>,
}

/// The remote host operations used by the `freeipa_host` lifecycle.
#[async_trait::async_trait]
pub trait HostApi: Send + Sync {
    /// Create a host.
    async fn host_add(
        &self,
        fqdn: &str,
        options: &HostAddOptions,
    ) -> Result<HostWriteResult, IpaError>;

    /// Modify an existing host.
    async fn host_mod(
        &self,
        fqdn: &str,
        options: &HostModOptions,
    ) -> Result<HostWriteResult, IpaError>;

    /// Fetch a host.
    async fn host_show(&self, fqdn: &str) -> Result<HostRecord, IpaError>;

    /// Delete one or more hosts.
    async fn host_del(&self, fqdns: &[String]) -> Result<(), IpaError>;
}

/// Connection settings for [`IpaClient`].
#[derive(Clone)]
pub struct IpaClientConfig {
    /// FreeIPA server host name, optionally with scheme.
    pub host: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl fmt::Debug for IpaClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpaClientConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A FreeIPA JSON-RPC session.
pub struct IpaClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    logged_in: Mutex<bool>,
}

impl IpaClient {
    /// Build a client. No request is sent until the first call.
    pub fn new(config: IpaClientConfig) -> Result<Self, IpaError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url(&config.host),
            username: config.username,
            password: config.password,
            logged_in: Mutex::new(false),
        })
    }

    /// The server URL all endpoints are resolved against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn referer(&self) -> String {
        format!("{}/ipa", self.base_url)
    }

    async fn login(&self) -> Result<(), IpaError> {
        debug!(url = %self.base_url, user = %self.username, "Logging in to FreeIPA");
        let response = self
            .http
            .post(format!("{}/ipa/session/login_password", self.base_url))
            .header(REFERER, self.referer())
            .header(ACCEPT, "text/plain")
            .form(&[
                ("user", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IpaError::Login { status });
        }
        Ok(())
    }

    async fn ensure_session(&self) -> Result<(), IpaError> {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            self.login().await?;
            *logged_in = true;
        }
        Ok(())
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, IpaError> {
        Ok(self
            .http
            .post(format!("{}/ipa/session/json", self.base_url))
            .header(REFERER, self.referer())
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await?)
    }

    #[instrument(skip(self, args, options), level = "debug")]
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        options: Map<String, Value>,
    ) -> Result<Map<String, Value>, IpaError> {
        self.ensure_session().await?;

        let body = request_body(method, args, options);
        let mut response = self.post(&body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("FreeIPA session expired, logging in again");
            let mut logged_in = self.logged_in.lock().await;
            self.login().await?;
            *logged_in = true;
            drop(logged_in);
            response = self.post(&body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IpaError::Status { status, body });
        }

        let payload: Value = response.json().await?;
        decode_response(payload)
    }
}

#[async_trait::async_trait]
impl HostApi for IpaClient {
    async fn host_add(
        &self,
        fqdn: &str,
        options: &HostAddOptions,
    ) -> Result<HostWriteResult, IpaError> {
        let result = self
            .call("host_add", vec![json!(fqdn)], encode_options(options)?)
            .await?;
        Ok(write_result(&result))
    }

    async fn host_mod(
        &self,
        fqdn: &str,
        options: &HostModOptions,
    ) -> Result<HostWriteResult, IpaError> {
        let result = self
            .call("host_mod", vec![json!(fqdn)], encode_options(options)?)
            .await?;
        Ok(write_result(&result))
    }

    async fn host_show(&self, fqdn: &str) -> Result<HostRecord, IpaError> {
        let result = self
            .call("host_show", vec![json!(fqdn)], Map::new())
            .await?;
        Ok(host_record(&result))
    }

    async fn host_del(&self, fqdns: &[String]) -> Result<(), IpaError> {
        self.call("host_del", vec![json!(fqdns)], Map::new())
            .await?;
        Ok(())
    }
}

fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

fn encode_options<T: Serialize>(options: &T) -> Result<Map<String, Value>, IpaError> {
    match serde_json::to_value(options)? {
        Value::Object(map) => Ok(map),
        other => Err(IpaError::InvalidResponse(format!(
            "options must encode to an object, got {}",
            other
        ))),
    }
}

/// Build a JSON-RPC request body. The API version is always appended to the
/// options.
pub(crate) fn request_body(method: &str, args: Vec<Value>, mut options: Map<String, Value>) -> Value {
    options.insert("version".to_string(), json!(API_VERSION));
    json!({
        "method": method,
        "params": [args, options],
        "id": 0,
    })
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

/// Turn a JSON-RPC envelope into the method's inner `result` object.
pub(crate) fn decode_response(payload: Value) -> Result<Map<String, Value>, IpaError> {
    let response: RpcResponse = serde_json::from_value(payload)?;

    if let Some(err) = response.error {
        return Err(IpaError::Api {
            code: err.code,
            name: err.name,
            message: err.message,
        });
    }

    let outer = response
        .result
        .ok_or_else(|| IpaError::InvalidResponse("missing result".to_string()))?;

    // host_del and friends answer with {"result": {"failed": [...]}, ...};
    // every method nests the entity under a second "result" key.
    match outer {
        Value::Object(mut outer) => match outer.remove("result") {
            Some(Value::Object(inner)) => Ok(inner),
            Some(Value::Null) | None => Ok(Map::new()),
            Some(other) => Err(IpaError::InvalidResponse(format!(
                "unexpected result payload: {}",
                other
            ))),
        },
        other => Err(IpaError::InvalidResponse(format!(
            "unexpected result envelope: {}",
            other
        ))),
    }
}

/// Read a FreeIPA attribute as a string.
///
/// Attributes come back as scalars, single-element lists, or
/// `{"__base64__": "..."}` for binary values.
pub(crate) fn attribute_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.first().and_then(attribute_string),
        Value::Object(obj) => obj
            .get("__base64__")
            .and_then(Value::as_str)
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn field(result: &Map<String, Value>, name: &str) -> Option<String> {
    result.get(name).and_then(attribute_string)
}

fn write_result(result: &Map<String, Value>) -> HostWriteResult {
    HostWriteResult {
        randompassword: field(result, "randompassword"),
    }
}

fn host_record(result: &Map<String, Value>) -> HostRecord {
    HostRecord {
        fqdn: field(result, "fqdn"),
        description: field(result, "description"),
        userpassword: field(result, "userpassword"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("ipa.example.com"), "https://ipa.example.com");
        assert_eq!(base_url("ipa.example.com/"), "https://ipa.example.com");
        assert_eq!(
            base_url("http://localhost:8080"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_request_body_appends_version() {
        let options = encode_options(&HostAddOptions {
            description: Some("d1".to_string()),
            random: Some(false),
            force: Some(false),
            userpassword: None,
        })
        .unwrap();

        let body = request_body("host_add", vec![json!("a.test")], options);

        assert_eq!(body["method"], "host_add");
        assert_eq!(body["id"], 0);
        assert_eq!(body["params"][0], json!(["a.test"]));
        assert_eq!(
            body["params"][1],
            json!({
                "description": "d1",
                "random": false,
                "force": false,
                "version": API_VERSION,
            })
        );
    }

    #[test]
    fn test_host_del_args_are_a_list() {
        let fqdns = vec!["a.test".to_string()];
        let body = request_body("host_del", vec![json!(fqdns)], Map::new());
        assert_eq!(body["params"][0], json!([["a.test"]]));
        assert_eq!(body["params"][1], json!({"version": API_VERSION}));
    }

    #[test]
    fn test_mod_options_skip_unset_fields() {
        let options = encode_options(&HostModOptions {
            description: Some(String::new()),
            random: Some(true),
            userpassword: None,
        })
        .unwrap();
        assert_eq!(options.get("description"), Some(&json!("")));
        assert!(!options.contains_key("userpassword"));
    }

    #[test]
    fn test_decode_show_response() {
        let payload = json!({
            "result": {
                "result": {
                    "fqdn": ["a.test"],
                    "description": ["web server"],
                    "has_password": true,
                    "dn": "fqdn=a.test,cn=computers,cn=accounts,dc=test",
                },
                "value": "a.test",
                "summary": null,
            },
            "error": null,
            "id": 0,
            "principal": "admin@TEST",
            "version": "4.9.8",
        });

        let result = decode_response(payload).unwrap();
        let record = host_record(&result);
        assert_eq!(record.fqdn.as_deref(), Some("a.test"));
        assert_eq!(record.description.as_deref(), Some("web server"));
        assert_eq!(record.userpassword, None);
    }

    #[test]
    fn test_decode_add_response_with_random_password() {
        let payload = json!({
            "result": {
                "result": {
                    "fqdn": ["a.test"],
                    "randompassword": "Xy7-generated",
                    "has_password": true,
                },
                "value": "a.test",
                "summary": "Added host \"a.test\"",
            },
            "error": null,
            "id": 0,
        });

        let result = decode_response(payload).unwrap();
        assert_eq!(
            write_result(&result).randompassword.as_deref(),
            Some("Xy7-generated")
        );
    }

    #[test]
    fn test_decode_error_response() {
        let payload = json!({
            "result": null,
            "error": {
                "code": 4001,
                "name": "NotFound",
                "message": "a.test: host not found",
                "data": {"reason": "a.test: host not found"},
            },
            "id": 0,
        });

        match decode_response(payload) {
            Err(IpaError::Api {
                code,
                name,
                message,
            }) => {
                assert_eq!(code, NOT_FOUND_CODE);
                assert_eq!(name, "NotFound");
                assert_eq!(message, "a.test: host not found");
            },
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_delete_response() {
        let payload = json!({
            "result": {"result": {"failed": []}, "value": ["a.test"], "summary": "Deleted host \"a.test\""},
            "error": null,
            "id": 0,
        });
        let result = decode_response(payload).unwrap();
        assert_eq!(result.get("failed"), Some(&json!([])));
    }

    #[test]
    fn test_decode_missing_result() {
        let err = decode_response(json!({"error": null, "id": 0})).unwrap_err();
        assert!(matches!(err, IpaError::InvalidResponse(_)));
    }

    #[test]
    fn test_attribute_string_encodings() {
        assert_eq!(attribute_string(&json!("plain")), Some("plain".to_string()));
        assert_eq!(attribute_string(&json!(["first", "second"])), Some("first".to_string()));
        assert_eq!(attribute_string(&json!([])), None);
        assert_eq!(attribute_string(&Value::Null), None);
        assert_eq!(
            attribute_string(&json!([{"__base64__": "c2VjcmV0"}])),
            Some("secret".to_string())
        );
        assert_eq!(attribute_string(&json!({"other": 1})), None);
    }

    #[test]
    fn test_not_found_display() {
        assert_eq!(
            IpaError::not_found("a.test").to_string(),
            "NotFound (4001): a.test: host not found"
        );
    }

    #[test]
    fn test_client_config_debug_redacts_password() {
        let config = IpaClientConfig {
            host: "ipa.example.com".to_string(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            insecure: false,
            timeout: Duration::from_secs(30),
        };
        let debug = format!("{:?}", config);
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_client_builds_without_network() {
        let client = IpaClient::new(IpaClientConfig {
            host: "ipa.example.com".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            insecure: true,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(client.base_url(), "https://ipa.example.com");
        assert!(!*client.logged_in.lock().await);
    }

    mod session {
        use super::*;
        use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        const LOGIN: &str = "/ipa/session/login_password";
        const JSON: &str = "/ipa/session/json";

        fn client_for(server: &MockServer) -> IpaClient {
            IpaClient::new(IpaClientConfig {
                host: server.uri(),
                username: "admin".to_string(),
                password: "secret".to_string(),
                insecure: false,
                timeout: Duration::from_secs(5),
            })
            .unwrap()
        }

        fn session_cookie() -> ResponseTemplate {
            ResponseTemplate::new(200).insert_header("set-cookie", "ipa_session=abc123; Path=/")
        }

        fn show_result() -> ResponseTemplate {
            ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "result": {"fqdn": ["a.test"], "description": ["web"]},
                    "value": "a.test",
                    "summary": null,
                },
                "error": null,
                "id": 0,
            }))
        }

        #[tokio::test]
        async fn test_logs_in_once_and_reuses_session() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(LOGIN))
                .and(header("referer", format!("{}/ipa", server.uri()).as_str()))
                .and(body_string_contains("user=admin"))
                .and(body_string_contains("password=secret"))
                .respond_with(session_cookie())
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .and(header("cookie", "ipa_session=abc123"))
                .and(body_partial_json(json!({
                    "method": "host_show",
                    "params": [["a.test"], {"version": API_VERSION}],
                })))
                .respond_with(show_result())
                .expect(2)
                .mount(&server)
                .await;

            let client = client_for(&server);
            let record = client.host_show("a.test").await.unwrap();
            assert_eq!(record.fqdn.as_deref(), Some("a.test"));
            assert_eq!(record.description.as_deref(), Some("web"));
            client.host_show("a.test").await.unwrap();
        }

        #[tokio::test]
        async fn test_expired_session_logs_in_again() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(LOGIN))
                .respond_with(session_cookie())
                .expect(2)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .respond_with(ResponseTemplate::new(401))
                .up_to_n_times(1)
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .respond_with(show_result())
                .expect(1)
                .mount(&server)
                .await;

            let record = client_for(&server).host_show("a.test").await.unwrap();
            assert_eq!(record.description.as_deref(), Some("web"));
        }

        #[tokio::test]
        async fn test_error_payload_maps_to_api_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(LOGIN))
                .respond_with(session_cookie())
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "result": null,
                    "error": {
                        "code": 4002,
                        "name": "DuplicateEntry",
                        "message": "host with name \"a.test\" already exists",
                    },
                    "id": 0,
                })))
                .mount(&server)
                .await;

            let err = client_for(&server)
                .host_add("a.test", &HostAddOptions::default())
                .await
                .unwrap_err();
            match err {
                IpaError::Api { code, name, .. } => {
                    assert_eq!(code, 4002);
                    assert_eq!(name, "DuplicateEntry");
                },
                other => panic!("expected Api error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_server_error_maps_to_status() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(LOGIN))
                .respond_with(session_cookie())
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
                .mount(&server)
                .await;

            let err = client_for(&server)
                .host_del(&["a.test".to_string()])
                .await
                .unwrap_err();
            match err {
                IpaError::Status { status, body } => {
                    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                    assert_eq!(body, "Internal Server Error");
                },
                other => panic!("expected Status error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_rejected_login_never_calls_method() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path(LOGIN))
                .respond_with(ResponseTemplate::new(401))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path(JSON))
                .respond_with(show_result())
                .expect(0)
                .mount(&server)
                .await;

            let err = client_for(&server).host_show("a.test").await.unwrap_err();
            assert!(matches!(
                err,
                IpaError::Login { status } if status == StatusCode::UNAUTHORIZED
            ));
        }
    }
}
