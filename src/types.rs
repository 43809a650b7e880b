//! Plan, import and metadata types exchanged over the provider protocol.
//!
//! These wrap the raw protobuf messages; values travel as JSON bytes on the
//! wire and as [`serde_json::Value`] here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The attribute name.
    pub path: String,
    /// The value before the change (None if creating).
    pub before: Option<Value>,
    /// The value after the change (None if deleting).
    pub after: Option<Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// Create a change for a new attribute.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

fn decode_json(bytes: &[u8]) -> Option<Value> {
    if bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(bytes).ok()
    }
}

fn encode_json(value: Option<&Value>) -> Vec<u8> {
    value
        .and_then(|v| serde_json::to_vec(v).ok())
        .unwrap_or_default()
}

impl From<crate::generated::AttributeChange> for AttributeChange {
    fn from(proto: crate::generated::AttributeChange) -> Self {
        Self {
            path: proto.path,
            before: decode_json(&proto.before),
            after: decode_json(&proto.after),
        }
    }
}

impl From<AttributeChange> for crate::generated::AttributeChange {
    fn from(change: AttributeChange) -> Self {
        Self {
            before: encode_json(change.before.as_ref()),
            after: encode_json(change.after.as_ref()),
            path: change.path,
        }
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planned state after the operation.
    pub planned_state: Value,
    /// The list of attribute changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource requires replacement.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Create a plan result with no changes.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// Create a plan result with changes.
    pub fn with_changes(
        planned_state: Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }
}

/// A resource adopted by `ImportResourceState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The imported state.
    pub state: Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata returned by GetMetadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// List of resource type names.
    pub resources: Vec<String>,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
}

/// Server capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Whether the provider supports planning destroy operations.
    pub plan_destroy: bool,
}

/// The protocol version for the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// The handshake prefix output by providers.
pub const HANDSHAKE_PREFIX: &str = "HEMMER_PROVIDER";
