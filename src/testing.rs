//! Test support for the provider.
//!
//! [`ProviderTester`] drives a [`ProviderService`] without a gRPC server, and
//! [`InMemoryHostApi`] stands in for a FreeIPA server so lifecycle code can be
//! exercised without the network.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hemmer_provider_freeipa::retry::RetryPolicy;
//! use hemmer_provider_freeipa::testing::{InMemoryHostApi, ProviderTester};
//! use hemmer_provider_freeipa::FreeIpaProvider;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let api = InMemoryHostApi::new();
//! let provider = FreeIpaProvider::with_api(Arc::new(api.clone()), RetryPolicy::default());
//! let tester = ProviderTester::new(provider);
//!
//! let state = tester
//!     .lifecycle_create("freeipa_host", json!({"fqdn": "a.test", "description": "web"}))
//!     .await
//!     .unwrap();
//! assert_eq!(state["id"], "a.test");
//! assert!(api.host("a.test").is_some());
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;

use crate::client::{
    HostAddOptions, HostApi, HostModOptions, HostRecord, HostWriteResult, IpaError,
};
use crate::error::ProviderError;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::server::ProviderService;
use crate::types::{ImportedResource, PlanResult};

/// A test harness that calls a [`ProviderService`] directly.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Get the provider's schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Get the list of resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Validate provider configuration, failing on any error diagnostic.
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.validate_provider_config(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Configure the provider, failing on any error diagnostic.
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        let diagnostics = self.provider.configure(config).await?;
        check_diagnostics(diagnostics)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    /// Validate a resource configuration, failing on any error diagnostic.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        let diagnostics = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?;
        check_diagnostics(diagnostics)
    }

    /// Plan a resource creation (no prior state).
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed_state.clone(), proposed_state)
            .await
    }

    /// Plan a resource update.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(
                resource_type,
                Some(prior_state),
                proposed_state.clone(),
                proposed_state,
            )
            .await
    }

    /// Plan a resource deletion.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null, Value::Null)
            .await
    }

    /// Create a new resource.
    pub async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Read the current state of a resource.
    pub async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    /// Update an existing resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete a resource.
    pub async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Import an existing resource.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Upgrade resource state from an older schema version.
    pub async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .upgrade_resource_state(resource_type, version, state)
            .await
    }

    /// plan → create → read. Returns the state after the read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// plan → update → read. Returns the state after the read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;
        let updated = self
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }

    /// plan → delete.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, current_state.clone())
            .await?;
        self.delete(resource_type, current_state).await
    }
}

/// Error type for tester operations that may fail with diagnostics.
#[derive(Debug, Error)]
pub enum TestError {
    /// The operation returned error diagnostics.
    #[error("Operation failed with {} diagnostic(s): {}", .0.len(), summaries(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The operation failed with a provider error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

fn summaries(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| match &d.attribute {
            Some(attr) => format!("{} (at {})", d.summary, attr),
            None => d.summary.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

/// Assert that a plan creates the resource.
///
/// # Panics
///
/// Panics if the plan has no changes or requires replacement.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(
        !plan.changes.is_empty(),
        "Expected plan to have changes for create, but got no changes"
    );
    assert!(!plan.requires_replace, "Expected plan to create, not replace");
}

/// Assert that a plan has no changes.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no changes, but got {} change(s): {:?}",
        plan.changes.len(),
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that a plan requires replacement.
///
/// # Panics
///
/// Panics if the plan does not require replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "Expected plan to require replacement, but it does not"
    );
}

/// Assert that a plan changes the resource in place.
///
/// # Panics
///
/// Panics if the plan has no changes or requires replacement.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "Expected plan to have changes");
    assert!(
        !plan.requires_replace,
        "Expected plan to update in place, but it requires replacement"
    );
}

/// Assert that a plan changes the given attribute.
///
/// # Panics
///
/// Panics if no change has the given path.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "Expected plan to change attribute '{}', but it was not changed. Changed attributes: {:?}",
        path,
        plan.changes.iter().map(|c| &c.path).collect::<Vec<_>>()
    );
}

/// Assert that diagnostics contain no errors.
///
/// # Panics
///
/// Panics if there are any error diagnostics.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors: Vec<_> = diagnostics.iter().filter(|d| d.is_error()).collect();
    assert!(
        errors.is_empty(),
        "Expected no errors, but got {} error(s): {:?}",
        errors.len(),
        errors.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// Assert that some error diagnostic's summary contains `substring`.
///
/// # Panics
///
/// Panics if no error diagnostic matches.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.is_error() && d.summary.contains(substring)),
        "Expected an error containing '{}', got: {:?}",
        substring,
        diagnostics.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}

/// A call recorded by [`InMemoryHostApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    /// `host_add`
    Add {
        /// Target host.
        fqdn: String,
        /// Options as sent.
        options: HostAddOptions,
    },
    /// `host_mod`
    Mod {
        /// Target host.
        fqdn: String,
        /// Options as sent.
        options: HostModOptions,
    },
    /// `host_show`
    Show {
        /// Target host.
        fqdn: String,
    },
    /// `host_del`
    Del {
        /// Target hosts.
        fqdns: Vec<String>,
    },
}

/// The method of a [`HostCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCallKind {
    /// `host_add`
    Add,
    /// `host_mod`
    Mod,
    /// `host_show`
    Show,
    /// `host_del`
    Del,
}

impl HostCall {
    /// The method this call invoked.
    pub fn kind(&self) -> HostCallKind {
        match self {
            HostCall::Add { .. } => HostCallKind::Add,
            HostCall::Mod { .. } => HostCallKind::Mod,
            HostCall::Show { .. } => HostCallKind::Show,
            HostCall::Del { .. } => HostCallKind::Del,
        }
    }
}

#[derive(Default)]
struct Directory {
    hosts: BTreeMap<String, HostRecord>,
    calls: Vec<HostCall>,
    failing_shows: u32,
    generated: u32,
}

impl Directory {
    fn next_password(&mut self) -> String {
        self.generated += 1;
        format!("generated-{}", self.generated)
    }
}

/// An in-process FreeIPA host directory.
///
/// Clones share the same directory, so a test can hand one clone to the
/// provider and inspect the other.
#[derive(Clone, Default)]
pub struct InMemoryHostApi {
    inner: Arc<Mutex<Directory>>,
}

impl InMemoryHostApi {
    /// An empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a host.
    pub fn with_host(self, fqdn: &str, record: HostRecord) -> Self {
        self.lock().hosts.insert(fqdn.to_string(), record);
        self
    }

    /// Make the next `n` `host_show` calls fail with `NotFound`, as a replica
    /// that has not caught up would.
    pub fn fail_next_shows(&self, n: u32) {
        self.lock().failing_shows = n;
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<HostCall> {
        self.lock().calls.clone()
    }

    /// Number of calls of the given kind.
    pub fn count(&self, kind: HostCallKind) -> usize {
        self.lock().calls.iter().filter(|c| c.kind() == kind).count()
    }

    /// The stored record for a host.
    pub fn host(&self, fqdn: &str) -> Option<HostRecord> {
        self.lock().hosts.get(fqdn).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

#[async_trait::async_trait]
impl HostApi for InMemoryHostApi {
    async fn host_add(
        &self,
        fqdn: &str,
        options: &HostAddOptions,
    ) -> Result<HostWriteResult, IpaError> {
        let mut dir = self.lock();
        dir.calls.push(HostCall::Add {
            fqdn: fqdn.to_string(),
            options: options.clone(),
        });

        if dir.hosts.contains_key(fqdn) {
            return Err(IpaError::Api {
                code: 4002,
                name: "DuplicateEntry".to_string(),
                message: format!("host with name \"{}\" already exists", fqdn),
            });
        }

        let randompassword = if options.random == Some(true) {
            Some(dir.next_password())
        } else {
            None
        };
        dir.hosts.insert(
            fqdn.to_string(),
            HostRecord {
                fqdn: Some(fqdn.to_string()),
                description: non_empty(&options.description),
                userpassword: non_empty(&options.userpassword),
            },
        );
        Ok(HostWriteResult { randompassword })
    }

    async fn host_mod(
        &self,
        fqdn: &str,
        options: &HostModOptions,
    ) -> Result<HostWriteResult, IpaError> {
        let mut dir = self.lock();
        dir.calls.push(HostCall::Mod {
            fqdn: fqdn.to_string(),
            options: options.clone(),
        });

        let randompassword = if options.random == Some(true) {
            Some(dir.next_password())
        } else {
            None
        };
        let record = dir
            .hosts
            .get_mut(fqdn)
            .ok_or_else(|| IpaError::not_found(fqdn))?;
        if let Some(description) = &options.description {
            record.description = non_empty(&Some(description.clone()));
        }
        if let Some(userpassword) = non_empty(&options.userpassword) {
            record.userpassword = Some(userpassword);
        }
        Ok(HostWriteResult { randompassword })
    }

    async fn host_show(&self, fqdn: &str) -> Result<HostRecord, IpaError> {
        let mut dir = self.lock();
        dir.calls.push(HostCall::Show {
            fqdn: fqdn.to_string(),
        });

        if dir.failing_shows > 0 {
            dir.failing_shows -= 1;
            return Err(IpaError::not_found(fqdn));
        }
        dir.hosts
            .get(fqdn)
            .cloned()
            .ok_or_else(|| IpaError::not_found(fqdn))
    }

    async fn host_del(&self, fqdns: &[String]) -> Result<(), IpaError> {
        let mut dir = self.lock();
        dir.calls.push(HostCall::Del {
            fqdns: fqdns.to_vec(),
        });

        if let Some(missing) = fqdns.iter().find(|f| !dir.hosts.contains_key(f.as_str())) {
            return Err(IpaError::not_found(missing));
        }
        for fqdn in fqdns {
            dir.hosts.remove(fqdn);
        }
        Ok(())
    }
}
