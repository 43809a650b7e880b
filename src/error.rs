//! Error types for the FreeIPA provider.

use serde_json::Value;
use thiserror::Error;

use crate::client::IpaError;

/// Errors returned by provider callbacks.
///
/// Remote failures are carried unchanged in [`ProviderError::Ipa`]; the
/// lifecycle callbacks never reclassify them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is not configured, or its configuration is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A resource value failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested resource type is not served by this provider.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// Invalid request from the orchestrator.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A state or config blob could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The FreeIPA server or the transport to it returned an error.
    #[error(transparent)]
    Ipa(#[from] IpaError),

    /// A freshly created host never became readable within the retry budget.
    #[error("Host {fqdn} was not readable after {attempts} attempt(s): {last_error}")]
    ReadRetriesExhausted {
        /// The host that was created.
        fqdn: String,
        /// Number of read attempts made.
        attempts: u32,
        /// The error returned by the final attempt.
        #[source]
        last_error: IpaError,
    },

    /// A remote write went through but a later step failed. `state` is the
    /// record as it now exists in FreeIPA and must still be persisted.
    #[error("{error}")]
    PartialState {
        /// State of the resource after the write.
        state: Box<Value>,
        /// The failure that stopped the operation.
        error: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Wrap `error` with the state left behind by a completed write.
    pub fn with_partial_state(state: Value, error: ProviderError) -> Self {
        Self::PartialState {
            state: Box::new(state),
            error: Box::new(error),
        }
    }

    /// The state to persist despite the failure, if any.
    pub fn partial_state(&self) -> Option<&Value> {
        match self {
            Self::PartialState { state, .. } => Some(state.as_ref()),
            _ => None,
        }
    }

    /// The error without any partial state attached.
    pub fn cause(&self) -> &ProviderError {
        match self {
            Self::PartialState { error, .. } => error.cause(),
            other => other,
        }
    }

    /// Get the error message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Configuration(msg) => msg.clone(),
            Self::Validation(msg) => msg.clone(),
            Self::UnknownResource(msg) => msg.clone(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::Serialization(err) => err.to_string(),
            Self::Ipa(err) => err.to_string(),
            Self::ReadRetriesExhausted { last_error, .. } => last_error.to_string(),
            Self::PartialState { error, .. } => error.message(),
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::Ipa(err) => ipa_status(&err),
            err @ ProviderError::ReadRetriesExhausted { .. } => {
                tonic::Status::deadline_exceeded(err.to_string())
            },
            ProviderError::PartialState { error, .. } => (*error).into(),
        }
    }
}

fn ipa_status(err: &IpaError) -> tonic::Status {
    match err {
        IpaError::Api { code: 4001, .. } => tonic::Status::not_found(err.to_string()),
        IpaError::Api { code: 4002, .. } => tonic::Status::already_exists(err.to_string()),
        IpaError::Login { .. } => tonic::Status::unauthenticated(err.to_string()),
        IpaError::Http(_) => tonic::Status::unavailable(err.to_string()),
        _ => tonic::Status::internal(err.to_string()),
    }
}
