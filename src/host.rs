//! The `freeipa_host` resource.
//!
//! Each lifecycle callback takes the remote [`HostApi`] explicitly and works
//! on a typed [`HostState`] record decoded from the orchestrator's state.
//!
//! `randompassword` is only ever written from `host_add`/`host_mod`
//! responses; `host_show` does not return it, so [`read`] leaves it alone.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::{HostAddOptions, HostApi, HostModOptions, HostRecord, HostWriteResult, IpaError};
use crate::error::ProviderError;
use crate::retry::{retry, RetryPolicy};
use crate::schema::{Attribute, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Resource type name.
pub const RESOURCE_TYPE: &str = "freeipa_host";

/// Local record of a FreeIPA host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostState {
    /// Identifier; equals `fqdn` once the host exists.
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    /// Fully qualified domain name.
    #[serde(deserialize_with = "null_as_default")]
    pub fqdn: String,
    /// Host description.
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    /// Request a server-generated one-time password.
    #[serde(deserialize_with = "null_as_default")]
    pub random: bool,
    /// Explicit one-time password.
    #[serde(deserialize_with = "null_as_default")]
    pub userpassword: String,
    /// Last password generated by the server.
    #[serde(deserialize_with = "null_as_default")]
    pub randompassword: String,
    /// Skip FreeIPA's DNS checks on create.
    #[serde(deserialize_with = "null_as_default")]
    pub force: bool,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl HostState {
    /// Decode a state or config blob. The `fqdn` must be set.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        let state: Self = serde_json::from_value(value)?;
        if state.fqdn.trim().is_empty() {
            return Err(ProviderError::Validation(
                "fqdn must not be empty".to_string(),
            ));
        }
        Ok(state)
    }

    /// Encode the record as a state blob.
    pub fn to_value(&self) -> Result<Value, ProviderError> {
        Ok(serde_json::to_value(self)?)
    }

    /// The configurable attributes, in schema order of importance.
    fn configurable(&self) -> [(&'static str, Value); 5] {
        [
            ("fqdn", json!(self.fqdn)),
            ("description", json!(self.description)),
            ("random", json!(self.random)),
            ("userpassword", json!(self.userpassword)),
            ("force", json!(self.force)),
        ]
    }
}

/// Schema for `freeipa_host`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_description("A host enrolled in FreeIPA")
        .with_attribute(
            "id",
            Attribute::computed_string().with_description("Same as fqdn"),
        )
        .with_attribute(
            "fqdn",
            Attribute::required_string()
                .with_description("Fully qualified domain name of the host")
                .with_force_new(),
        )
        .with_attribute(
            "description",
            Attribute::optional_string().with_description("Free-form host description"),
        )
        .with_attribute(
            "random",
            Attribute::optional_bool()
                .with_description("Generate a random one-time enrollment password")
                .with_default(json!(false)),
        )
        .with_attribute(
            "userpassword",
            Attribute::optional_string()
                .with_description("One-time enrollment password")
                .sensitive(),
        )
        .with_attribute(
            "randompassword",
            Attribute::computed_string()
                .with_description("Password generated when random is set")
                .sensitive(),
        )
        .with_attribute(
            "force",
            Attribute::optional_bool()
                .with_description("Add the host even if its name does not resolve")
                .with_default(json!(false)),
        )
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn store_random_password(state: &mut HostState, result: HostWriteResult) {
    if !state.random {
        return;
    }
    match result.randompassword {
        Some(password) => state.randompassword = password,
        None => warn!(fqdn = %state.fqdn, "FreeIPA returned no random password"),
    }
}

fn apply_record(state: &mut HostState, record: HostRecord) {
    if let Some(description) = record.description {
        state.description = description;
    }
    if let Some(userpassword) = record.userpassword {
        state.userpassword = userpassword;
    }
}

/// Attach the post-write record to `error` so it is not lost.
fn after_write(state: &HostState, error: ProviderError) -> ProviderError {
    match state.to_value() {
        Ok(value) => ProviderError::with_partial_state(value, error),
        Err(_) => error,
    }
}

async fn show(api: &dyn HostApi, fqdn: &str) -> Result<HostRecord, IpaError> {
    info!(fqdn = %fqdn, "Refreshing host");
    api.host_show(fqdn).await
}

/// Create the host, then read it back.
///
/// The read is retried under `policy` because a replica behind a load
/// balancer may not have the new entry yet.
pub async fn create(
    api: &dyn HostApi,
    state: &mut HostState,
    policy: &RetryPolicy,
) -> Result<(), ProviderError> {
    info!(fqdn = %state.fqdn, "Creating host");

    let options = HostAddOptions {
        description: Some(state.description.clone()),
        random: Some(state.random),
        force: Some(state.force),
        userpassword: non_empty(&state.userpassword),
    };
    let result = api.host_add(&state.fqdn, &options).await?;

    state.id = state.fqdn.clone();
    store_random_password(state, result);

    let fqdn = state.fqdn.clone();
    let outcome = retry(policy, || show(api, &fqdn)).await;
    let record = match outcome {
        Ok(record) => record,
        Err(exhausted) => {
            let error = ProviderError::ReadRetriesExhausted {
                fqdn,
                attempts: exhausted.attempts,
                last_error: exhausted.last_error,
            };
            return Err(after_write(state, error));
        },
    };
    apply_record(state, record);

    Ok(())
}

/// Refresh `description` and `userpassword` from the server.
pub async fn read(api: &dyn HostApi, state: &mut HostState) -> Result<(), ProviderError> {
    let record = show(api, &state.fqdn).await?;
    apply_record(state, record);
    Ok(())
}

/// Modify the host, then read it back once.
pub async fn update(api: &dyn HostApi, state: &mut HostState) -> Result<(), ProviderError> {
    info!(fqdn = %state.fqdn, "Updating host");

    let options = HostModOptions {
        description: Some(state.description.clone()),
        random: Some(state.random),
        userpassword: non_empty(&state.userpassword),
    };
    let result = api.host_mod(&state.fqdn, &options).await?;
    store_random_password(state, result);

    if let Err(error) = read(api, state).await {
        return Err(after_write(state, error));
    }
    Ok(())
}

/// Delete the host and clear the identifier.
pub async fn delete(api: &dyn HostApi, state: &mut HostState) -> Result<(), ProviderError> {
    info!(fqdn = %state.fqdn, "Deleting host");

    api.host_del(std::slice::from_ref(&state.fqdn)).await?;
    state.id.clear();
    Ok(())
}

/// Adopt an existing host by FQDN.
pub async fn import(api: &dyn HostApi, id: &str) -> Result<HostState, ProviderError> {
    info!(id = %id, "Importing host");

    let mut state = HostState {
        id: id.to_string(),
        fqdn: id.to_string(),
        ..Default::default()
    };
    read(api, &mut state).await?;
    Ok(state)
}

/// Plan the transition from `prior` to `proposed`.
///
/// `None` on either side stands for an absent host. A changed `fqdn` requires
/// replacement; the computed `randompassword` is carried over from `prior`.
/// A change to `force` alone plans no update, since `host_mod` cannot apply it.
pub fn plan(
    prior: Option<HostState>,
    proposed: Option<HostState>,
) -> Result<PlanResult, ProviderError> {
    match (prior, proposed) {
        (None, None) => Ok(PlanResult::no_change(Value::Null)),
        (Some(prior), None) => Ok(PlanResult::with_changes(
            Value::Null,
            vec![AttributeChange::removed("fqdn", json!(prior.fqdn))],
            false,
        )),
        (None, Some(mut planned)) => {
            planned.id = planned.fqdn.clone();
            planned.randompassword.clear();
            let changes = planned
                .configurable()
                .into_iter()
                .filter(|(_, value)| value.as_str() != Some(""))
                .map(|(name, value)| AttributeChange::added(name, value))
                .collect();
            Ok(PlanResult::with_changes(planned.to_value()?, changes, false))
        },
        (Some(prior), Some(mut planned)) => {
            let requires_replace = schema()
                .force_new_attributes()
                .any(|name| name == "fqdn" && prior.fqdn != planned.fqdn);

            planned.id = if requires_replace {
                planned.fqdn.clone()
            } else {
                prior.id.clone()
            };
            planned.randompassword = prior.randompassword.clone();

            let changes: Vec<_> = prior
                .configurable()
                .into_iter()
                .zip(planned.configurable())
                .filter(|((_, before), (_, after))| before != after)
                // force only affects host_add, so alone it is not an update
                .filter(|((name, _), _)| requires_replace || *name != "force")
                .map(|((name, before), (_, after))| AttributeChange::modified(name, before, after))
                .collect();

            if changes.is_empty() {
                Ok(PlanResult::no_change(planned.to_value()?))
            } else {
                Ok(PlanResult::with_changes(
                    planned.to_value()?,
                    changes,
                    requires_replace,
                ))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, HostCallKind, InMemoryHostApi};
    use std::time::Duration;
    use tokio::time::Instant;

    fn host(fqdn: &str) -> HostState {
        HostState {
            fqdn: fqdn.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_sends_exact_options_and_reads_back() {
        let api = InMemoryHostApi::new();
        let mut state = HostState {
            fqdn: "a.test".to_string(),
            description: "d1".to_string(),
            random: false,
            userpassword: "p1".to_string(),
            force: false,
            ..Default::default()
        };

        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();

        assert_eq!(
            api.calls()[0],
            HostCall::Add {
                fqdn: "a.test".to_string(),
                options: HostAddOptions {
                    description: Some("d1".to_string()),
                    random: Some(false),
                    force: Some(false),
                    userpassword: Some("p1".to_string()),
                },
            }
        );
        assert_eq!(state.id, "a.test");
        assert_eq!(state.description, "d1");
        assert_eq!(state.userpassword, "p1");
        assert!(state.randompassword.is_empty());
    }

    #[tokio::test]
    async fn test_create_omits_empty_password() {
        let api = InMemoryHostApi::new();
        let mut state = host("a.test");

        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();

        match &api.calls()[0] {
            HostCall::Add { options, .. } => {
                assert_eq!(options.userpassword, None);
                assert_eq!(options.description, Some(String::new()));
            },
            other => panic!("expected host_add, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_with_random_stores_generated_password() {
        let api = InMemoryHostApi::new();
        let mut state = HostState {
            random: true,
            ..host("a.test")
        };

        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();
        assert!(!state.randompassword.is_empty());

        let generated = state.randompassword.clone();
        read(&api, &mut state).await.unwrap();
        assert_eq!(state.randompassword, generated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_absorbs_replication_lag() {
        let api = InMemoryHostApi::new();
        api.fail_next_shows(1);
        let mut state = host("a.test");
        let start = Instant::now();

        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(api.count(HostCallKind::Show), 2);
        assert_eq!(state.id, "a.test");
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_gives_up_with_distinct_error() {
        let api = InMemoryHostApi::new();
        api.fail_next_shows(u32::MAX);
        let mut state = host("a.test");
        let policy = RetryPolicy::new(Duration::from_secs(1), 3);

        let err = create(&api, &mut state, &policy).await.unwrap_err();

        assert_eq!(err.partial_state().unwrap()["id"], "a.test");
        match err.cause() {
            ProviderError::ReadRetriesExhausted {
                fqdn,
                attempts,
                last_error,
            } => {
                assert_eq!(fqdn, "a.test");
                assert_eq!(*attempts, 3);
                assert!(matches!(last_error, IpaError::Api { code: 4001, .. }));
            },
            other => panic!("expected ReadRetriesExhausted, got {:?}", other),
        }
        assert_eq!(api.count(HostCallKind::Show), 3);
        // The host exists remotely, so the identifier stays set.
        assert_eq!(state.id, "a.test");
    }

    #[tokio::test]
    async fn test_failed_add_leaves_no_identifier() {
        let api = InMemoryHostApi::new().with_host("a.test", HostRecord::default());
        let mut state = host("a.test");

        let err = create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Ipa(IpaError::Api { code: 4002, .. })));
        assert!(state.id.is_empty());
        assert_eq!(api.count(HostCallKind::Show), 0);
    }

    #[tokio::test]
    async fn test_update_with_random_overwrites_password() {
        let api = InMemoryHostApi::new();
        let mut state = HostState {
            random: true,
            ..host("a.test")
        };
        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();
        let first = state.randompassword.clone();

        update(&api, &mut state).await.unwrap();

        assert!(!state.randompassword.is_empty());
        assert_ne!(state.randompassword, first);
    }

    #[tokio::test]
    async fn test_update_without_random_keeps_password() {
        let api = InMemoryHostApi::new();
        let mut state = HostState {
            random: true,
            ..host("a.test")
        };
        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();
        let generated = state.randompassword.clone();

        state.random = false;
        state.description = "d2".to_string();
        update(&api, &mut state).await.unwrap();

        assert_eq!(state.randompassword, generated);
        assert_eq!(state.description, "d2");
        match api.calls().iter().rev().find(|c| matches!(c, HostCall::Mod { .. })) {
            Some(HostCall::Mod { fqdn, options }) => {
                assert_eq!(fqdn, "a.test");
                assert_eq!(
                    options,
                    &HostModOptions {
                        description: Some("d2".to_string()),
                        random: Some(false),
                        userpassword: None,
                    }
                );
            },
            other => panic!("expected host_mod, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_reads_once_and_propagates_read_error() {
        let api = InMemoryHostApi::new().with_host("a.test", HostRecord::default());
        api.fail_next_shows(1);
        let mut state = host("a.test");

        let err = update(&api, &mut state).await.unwrap_err();

        assert!(matches!(err.cause(), ProviderError::Ipa(IpaError::Api { code: 4001, .. })));
        assert_eq!(err.partial_state().unwrap()["fqdn"], "a.test");
        assert_eq!(api.count(HostCallKind::Show), 1);
    }

    #[tokio::test]
    async fn test_failed_mod_carries_no_state() {
        let api = InMemoryHostApi::new();
        let mut state = host("a.test");

        let err = update(&api, &mut state).await.unwrap_err();

        assert!(err.partial_state().is_none());
        assert_eq!(api.count(HostCallKind::Show), 0);
    }

    #[tokio::test]
    async fn test_read_leaves_absent_fields_untouched() {
        let api = InMemoryHostApi::new().with_host(
            "a.test",
            HostRecord {
                fqdn: Some("a.test".to_string()),
                description: None,
                userpassword: None,
            },
        );
        let mut state = HostState {
            description: "local".to_string(),
            userpassword: "local-pw".to_string(),
            ..host("a.test")
        };

        read(&api, &mut state).await.unwrap();

        assert_eq!(state.description, "local");
        assert_eq!(state.userpassword, "local-pw");
    }

    #[tokio::test]
    async fn test_delete_then_read_reports_not_found() {
        let api = InMemoryHostApi::new();
        let mut state = host("a.test");
        create(&api, &mut state, &RetryPolicy::default())
            .await
            .unwrap();

        delete(&api, &mut state).await.unwrap();
        assert!(state.id.is_empty());
        assert_eq!(
            api.calls().last(),
            Some(&HostCall::Del {
                fqdns: vec!["a.test".to_string()]
            })
        );

        let err = read(&api, &mut state).await.unwrap_err();
        assert!(matches!(err, ProviderError::Ipa(IpaError::Api { code: 4001, .. })));
    }

    #[tokio::test]
    async fn test_delete_absent_host_surfaces_error() {
        let api = InMemoryHostApi::new();
        let mut state = HostState {
            id: "a.test".to_string(),
            ..host("a.test")
        };

        let err = delete(&api, &mut state).await.unwrap_err();

        assert!(matches!(err, ProviderError::Ipa(IpaError::Api { code: 4001, .. })));
        assert_eq!(state.id, "a.test");
    }

    #[tokio::test]
    async fn test_import_sets_identifier_and_fqdn_before_read() {
        let api = InMemoryHostApi::new().with_host(
            "host1.example.com",
            HostRecord {
                fqdn: Some("host1.example.com".to_string()),
                description: Some("imported".to_string()),
                userpassword: None,
            },
        );

        let state = import(&api, "host1.example.com").await.unwrap();

        assert_eq!(state.id, "host1.example.com");
        assert_eq!(state.fqdn, "host1.example.com");
        assert_eq!(state.description, "imported");
        assert_eq!(
            api.calls(),
            vec![HostCall::Show {
                fqdn: "host1.example.com".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_import_missing_host_fails() {
        let api = InMemoryHostApi::new();
        let err = import(&api, "ghost.test").await.unwrap_err();
        assert!(matches!(err, ProviderError::Ipa(IpaError::Api { code: 4001, .. })));
    }

    #[test]
    fn test_state_decoding() {
        let state = HostState::from_value(json!({
            "fqdn": "a.test",
            "description": null,
            "random": true,
        }))
        .unwrap();
        assert_eq!(state.fqdn, "a.test");
        assert_eq!(state.description, "");
        assert!(state.random);
        assert!(!state.force);

        assert!(matches!(
            HostState::from_value(json!({"fqdn": ""})),
            Err(ProviderError::Validation(_))
        ));
        assert!(matches!(
            HostState::from_value(json!({"fqdn": 1})),
            Err(ProviderError::Serialization(_))
        ));
    }

    #[test]
    fn test_plan_create() {
        let proposed = HostState {
            description: "web".to_string(),
            ..host("a.test")
        };

        let plan = plan(None, Some(proposed)).unwrap();

        assert!(!plan.requires_replace);
        assert_eq!(plan.planned_state["id"], "a.test");
        let paths: Vec<_> = plan.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["fqdn", "description", "random", "force"]);
    }

    #[test]
    fn test_plan_update_in_place_keeps_generated_password() {
        let prior = HostState {
            id: "a.test".to_string(),
            randompassword: "generated".to_string(),
            ..host("a.test")
        };
        let proposed = HostState {
            description: "new".to_string(),
            ..host("a.test")
        };

        let plan = plan(Some(prior), Some(proposed)).unwrap();

        assert!(!plan.requires_replace);
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].path, "description");
        assert_eq!(plan.planned_state["randompassword"], "generated");
        assert_eq!(plan.planned_state["id"], "a.test");
    }

    #[test]
    fn test_plan_fqdn_change_requires_replace() {
        let prior = HostState {
            id: "a.test".to_string(),
            ..host("a.test")
        };

        let plan = plan(Some(prior), Some(host("b.test"))).unwrap();

        assert!(plan.requires_replace);
        assert_eq!(plan.planned_state["id"], "b.test");
    }

    #[test]
    fn test_plan_ignores_force_unless_replacing() {
        let prior = HostState {
            id: "a.test".to_string(),
            ..host("a.test")
        };

        let only_force = plan(
            Some(prior.clone()),
            Some(HostState {
                force: true,
                ..host("a.test")
            }),
        )
        .unwrap();
        assert!(only_force.changes.is_empty());
        assert_eq!(only_force.planned_state["force"], true);

        let replaced = plan(
            Some(prior),
            Some(HostState {
                force: true,
                ..host("b.test")
            }),
        )
        .unwrap();
        assert!(replaced.requires_replace);
        let paths: Vec<_> = replaced.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["fqdn", "force"]);
    }

    #[test]
    fn test_plan_no_change_and_delete() {
        let prior = HostState {
            id: "a.test".to_string(),
            ..host("a.test")
        };

        let unchanged = plan(Some(prior.clone()), Some(host("a.test"))).unwrap();
        assert!(unchanged.changes.is_empty());

        let destroy = plan(Some(prior), None).unwrap();
        assert!(destroy.planned_state.is_null());
        assert_eq!(destroy.changes[0].path, "fqdn");
        assert!(destroy.changes[0].after.is_none());
    }

    #[test]
    fn test_schema_shape() {
        let schema = schema();
        assert!(schema.attribute("fqdn").unwrap().force_new);
        assert!(schema.attribute("randompassword").unwrap().flags.computed);
        assert!(schema.attribute("userpassword").unwrap().flags.sensitive);
        assert_eq!(
            schema.attribute("random").unwrap().default,
            Some(json!(false))
        );
    }
}
