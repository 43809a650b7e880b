//! Provider configuration.
//!
//! The `Configure` blob is decoded into [`ProviderConfig`]. `host`,
//! `username`, `password` and `insecure` fall back to the `FREEIPA_*`
//! environment variables when absent or null.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{IpaClient, IpaClientConfig};
use crate::error::ProviderError;
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::schema::{Attribute, Diagnostic, Schema};

/// Environment fallback for `host`.
pub const ENV_HOST: &str = "FREEIPA_HOST";
/// Environment fallback for `username`.
pub const ENV_USERNAME: &str = "FREEIPA_USERNAME";
/// Environment fallback for `password`.
pub const ENV_PASSWORD: &str = "FREEIPA_PASSWORD";
/// Environment fallback for `insecure`.
pub const ENV_INSECURE: &str = "FREEIPA_INSECURE";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    host: Option<String>,
    username: Option<String>,
    password: Option<String>,
    insecure: Option<bool>,
    read_retry_max_attempts: Option<i64>,
    read_retry_initial_delay_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
}

/// Resolved provider configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// FreeIPA server host name.
    pub host: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Policy for the read that follows a create.
    pub read_retry: RetryPolicy,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("read_retry", &self.read_retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ProviderConfig {
    /// Resolve a config blob using the process environment for fallbacks.
    pub fn from_value(value: &Value) -> Result<Self, Vec<Diagnostic>> {
        Self::resolve(value, |name| std::env::var(name).ok())
    }

    /// Resolve a config blob, looking fallbacks up through `env`.
    ///
    /// Every problem is reported, not just the first.
    pub fn resolve<E>(value: &Value, env: E) -> Result<Self, Vec<Diagnostic>>
    where
        E: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = match value {
            Value::Null => RawConfig::default(),
            other => serde_json::from_value(other.clone()).map_err(|e| {
                vec![Diagnostic::error("Invalid provider configuration").with_detail(e.to_string())]
            })?,
        };

        let mut diagnostics = Vec::new();

        let mut required = |name: &str, configured: Option<String>, var: &str| {
            match configured.filter(|v| !v.is_empty()).or_else(|| env(var).filter(|v| !v.is_empty())) {
                Some(v) => v,
                None => {
                    diagnostics.push(
                        Diagnostic::error(format!("Missing required attribute '{}'", name))
                            .with_detail(format!("Set it in the provider block or via {}", var))
                            .with_attribute(name),
                    );
                    String::new()
                },
            }
        };
        let host = required("host", raw.host, ENV_HOST);
        let username = required("username", raw.username, ENV_USERNAME);
        let password = required("password", raw.password, ENV_PASSWORD);

        let insecure = match raw.insecure {
            Some(insecure) => insecure,
            None => match env(ENV_INSECURE) {
                Some(v) => parse_bool(&v).unwrap_or_else(|| {
                    diagnostics.push(
                        Diagnostic::error(format!("Invalid value for {}", ENV_INSECURE))
                            .with_detail(format!("Expected a boolean, got '{}'", v))
                            .with_attribute("insecure"),
                    );
                    false
                }),
                None => false,
            },
        };

        let max_attempts = non_negative(
            "read_retry_max_attempts",
            raw.read_retry_max_attempts,
            &mut diagnostics,
        )
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let initial_delay = non_negative(
            "read_retry_initial_delay_ms",
            raw.read_retry_initial_delay_ms,
            &mut diagnostics,
        )
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_INITIAL_DELAY);
        let request_timeout = non_negative(
            "request_timeout_ms",
            raw.request_timeout_ms,
            &mut diagnostics,
        )
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        Ok(Self {
            host,
            username,
            password,
            insecure,
            read_retry: RetryPolicy::new(initial_delay, max_attempts),
            request_timeout,
        })
    }

    /// Settings for the JSON-RPC client.
    pub fn client_config(&self) -> IpaClientConfig {
        IpaClientConfig {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            timeout: self.request_timeout,
        }
    }

    /// Build the FreeIPA client. No request is sent yet.
    pub fn build_client(&self) -> Result<IpaClient, ProviderError> {
        Ok(IpaClient::new(self.client_config())?)
    }
}

fn non_negative(name: &str, value: Option<i64>, diagnostics: &mut Vec<Diagnostic>) -> Option<u64> {
    let value = value?;
    match u64::try_from(value) {
        Ok(v) => Some(v),
        Err(_) => {
            diagnostics.push(
                Diagnostic::error(format!("Invalid value for '{}'", name))
                    .with_detail(format!("Must not be negative, got {}", value))
                    .with_attribute(name),
            );
            None
        },
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Schema of the provider block.
///
/// Credentials are optional here because they may come from the environment.
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("Connection to a FreeIPA server")
        .with_attribute(
            "host",
            Attribute::optional_string()
                .with_description(format!("FreeIPA server host name. Falls back to {}", ENV_HOST)),
        )
        .with_attribute(
            "username",
            Attribute::optional_string()
                .with_description(format!("Login user. Falls back to {}", ENV_USERNAME)),
        )
        .with_attribute(
            "password",
            Attribute::optional_string()
                .with_description(format!("Login password. Falls back to {}", ENV_PASSWORD))
                .sensitive(),
        )
        .with_attribute(
            "insecure",
            Attribute::optional_bool()
                .with_description("Skip TLS certificate verification")
                .with_default(json!(false)),
        )
        .with_attribute(
            "read_retry_max_attempts",
            Attribute::optional_int64()
                .with_description("Attempts at reading a host back after creating it")
                .with_default(json!(DEFAULT_MAX_ATTEMPTS)),
        )
        .with_attribute(
            "read_retry_initial_delay_ms",
            Attribute::optional_int64()
                .with_description("Delay before the second read attempt; doubles after each failure")
                .with_default(json!(DEFAULT_INITIAL_DELAY.as_millis() as u64)),
        )
        .with_attribute(
            "request_timeout_ms",
            Attribute::optional_int64()
                .with_description("Timeout for each HTTP request")
                .with_default(json!(DEFAULT_REQUEST_TIMEOUT.as_millis() as u64)),
        )
}
