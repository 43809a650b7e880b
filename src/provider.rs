//! The FreeIPA provider.
//!
//! [`FreeIpaProvider`] implements [`ProviderService`] for the single
//! `freeipa_host` resource. The remote client is built by `configure` and
//! handed explicitly to each lifecycle callback in [`crate::host`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::client::HostApi;
use crate::config::{self, ProviderConfig};
use crate::error::ProviderError;
use crate::host::{self, HostState, RESOURCE_TYPE};
use crate::retry::RetryPolicy;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};
use crate::validation::{validate, validate_result};

#[derive(Clone)]
struct Session {
    api: Arc<dyn HostApi>,
    retry: RetryPolicy,
}

/// Provider for FreeIPA hosts.
#[derive(Default)]
pub struct FreeIpaProvider {
    session: RwLock<Option<Session>>,
}

impl FreeIpaProvider {
    /// An unconfigured provider. `configure` builds the FreeIPA client.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider that already talks to `api`. `configure` will replace it.
    pub fn with_api(api: Arc<dyn HostApi>, retry: RetryPolicy) -> Self {
        Self {
            session: RwLock::new(Some(Session { api, retry })),
        }
    }

    async fn session(&self) -> Result<Session, ProviderError> {
        self.session.read().await.clone().ok_or_else(|| {
            ProviderError::Configuration("Provider is not configured".to_string())
        })
    }
}

fn ensure_host_type(resource_type: &str) -> Result<(), ProviderError> {
    if resource_type == RESOURCE_TYPE {
        Ok(())
    } else {
        Err(ProviderError::UnknownResource(resource_type.to_string()))
    }
}

fn optional_state(value: Value) -> Result<Option<HostState>, ProviderError> {
    match value {
        Value::Null => Ok(None),
        value => HostState::from_value(value).map(Some),
    }
}

#[async_trait::async_trait]
impl ProviderService for FreeIpaProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema::new()
            .with_provider_config(config::schema())
            .with_resource(RESOURCE_TYPE, host::schema())
    }

    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let mut diagnostics = validate(&config::schema(), &config);
        if diagnostics.is_empty() {
            if let Err(errors) = ProviderConfig::from_value(&config) {
                diagnostics.extend(errors);
            }
        }
        Ok(diagnostics)
    }

    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        if let Err(errors) = validate_result(&config::schema(), &config) {
            return Ok(errors);
        }
        let mut diagnostics = Vec::new();

        let config = match ProviderConfig::from_value(&config) {
            Ok(config) => config,
            Err(errors) => return Ok(errors),
        };
        if config.insecure {
            warn!(host = %config.host, "TLS certificate verification is disabled");
            diagnostics.push(
                Diagnostic::warning("TLS certificate verification is disabled")
                    .with_attribute("insecure"),
            );
        }

        let api = config.build_client()?;
        info!(
            url = %api.base_url(),
            username = %config.username,
            read_retry_attempts = config.read_retry.max_attempts,
            "Configured FreeIPA client"
        );
        *self.session.write().await = Some(Session {
            api: Arc::new(api),
            retry: config.read_retry,
        });

        Ok(diagnostics)
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        ensure_host_type(resource_type)?;

        let mut diagnostics = validate(&host::schema(), &config);
        let fqdn_is_blank = config
            .get("fqdn")
            .and_then(Value::as_str)
            .map(|fqdn| fqdn.trim().is_empty())
            .unwrap_or(false);
        if fqdn_is_blank {
            diagnostics.push(
                Diagnostic::error("fqdn must not be empty")
                    .with_detail("A host is identified by its fully qualified domain name")
                    .with_attribute("fqdn"),
            );
        }
        Ok(diagnostics)
    }

    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        ensure_host_type(resource_type)?;

        let prior = match prior_state {
            Some(state) => optional_state(state)?,
            None => None,
        };
        host::plan(prior, optional_state(proposed_state)?)
    }

    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        ensure_host_type(resource_type)?;
        let session = self.session().await?;

        let mut state = HostState::from_value(planned_state)?;
        host::create(session.api.as_ref(), &mut state, &session.retry).await?;
        state.to_value()
    }

    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        ensure_host_type(resource_type)?;
        let session = self.session().await?;

        let mut state = HostState::from_value(current_state)?;
        host::read(session.api.as_ref(), &mut state).await?;
        state.to_value()
    }

    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        ensure_host_type(resource_type)?;
        let session = self.session().await?;

        let prior = HostState::from_value(prior_state)?;
        let mut state = HostState::from_value(planned_state)?;
        if state.fqdn != prior.fqdn {
            return Err(ProviderError::InvalidRequest(format!(
                "fqdn cannot change in place ({} -> {}); the host must be replaced",
                prior.fqdn, state.fqdn
            )));
        }
        if state.id.is_empty() {
            state.id = prior.id.clone();
        }
        if state.randompassword.is_empty() {
            state.randompassword = prior.randompassword;
        }

        host::update(session.api.as_ref(), &mut state).await?;
        state.to_value()
    }

    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        ensure_host_type(resource_type)?;
        let session = self.session().await?;

        let mut state = HostState::from_value(current_state)?;
        host::delete(session.api.as_ref(), &mut state).await
    }

    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        ensure_host_type(resource_type)?;
        if id.trim().is_empty() {
            return Err(ProviderError::InvalidRequest(
                "Import requires a host FQDN as the identifier".to_string(),
            ));
        }
        let session = self.session().await?;

        let state = host::import(session.api.as_ref(), id).await?;
        Ok(vec![ImportedResource::new(RESOURCE_TYPE, state.to_value()?)])
    }
}
