//! Schema types for describing the provider and its resources.
//!
//! Schemas describe the shape of the provider configuration and of each
//! resource. They drive validation, planning and the `GetSchema` response.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A boolean value.
    Bool,
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the provider (read-only).
    pub computed: bool,
    /// The attribute is sensitive and should be hidden in logs/UI.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed attribute (read-only, set by provider).
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }
}

/// Describes a single attribute in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// If set, changing this attribute forces resource replacement.
    #[serde(default)]
    pub force_new: bool,
    /// Default value for the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
        }
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    /// Create an optional int64 attribute.
    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    /// Create an optional bool attribute.
    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }
}

/// A block of attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Block {
    /// The attributes within this block, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    /// Human-readable description of the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema for a resource or the provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// The version of this schema (for state upgrades).
    #[serde(default)]
    pub version: u64,
    /// The root block containing all attributes.
    #[serde(flatten)]
    pub block: Block,
}

impl Schema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::default(),
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block.attributes.insert(name.into(), attr);
        self
    }

    /// Set the description of the root block.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.block.description = Some(description.into());
        self
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.block.attributes.get(name)
    }

    /// Names of attributes that force replacement when changed.
    pub fn force_new_attributes(&self) -> impl Iterator<Item = &str> {
        self.block
            .attributes
            .iter()
            .filter(|(_, attr)| attr.force_new)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::v0()
    }
}

/// The provider configuration schema plus one schema per resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Schema for provider configuration.
    #[serde(default)]
    pub provider: Schema,
    /// Schemas for each resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    /// Create a new empty provider schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider configuration schema.
    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    /// Add a resource schema.
    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A diagnostic message from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// Whether any diagnostic in the list is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_flags() {
        let required = AttributeFlags::required();
        assert!(required.required);
        assert!(!required.optional);
        assert!(!required.computed);

        let computed = AttributeFlags::computed();
        assert!(!computed.required);
        assert!(computed.computed);
    }

    #[test]
    fn test_attribute_builders() {
        let attr = Attribute::required_string()
            .with_description("Fully qualified host name")
            .with_force_new();

        assert_eq!(attr.attr_type, AttributeType::String);
        assert!(attr.flags.required);
        assert_eq!(attr.description.as_deref(), Some("Fully qualified host name"));
        assert!(attr.force_new);

        let attr = Attribute::optional_bool().with_default(serde_json::json!(false));
        assert_eq!(attr.default, Some(serde_json::json!(false)));

        let attr = Attribute::computed_string().sensitive();
        assert!(attr.flags.computed && attr.flags.sensitive);
    }

    #[test]
    fn test_schema_builder_and_lookup() {
        let schema = Schema::v0()
            .with_description("A host")
            .with_attribute("fqdn", Attribute::required_string().with_force_new())
            .with_attribute("description", Attribute::optional_string());

        assert_eq!(schema.version, 0);
        assert!(schema.attribute("fqdn").is_some());
        assert!(schema.attribute("missing").is_none());
        assert_eq!(schema.force_new_attributes().collect::<Vec<_>>(), vec!["fqdn"]);
    }

    #[test]
    fn test_attribute_serialization() {
        let attr = Attribute::optional_int64().with_description("Attempts");
        let value = serde_json::to_value(&attr).unwrap();
        assert_eq!(value["type"], "int64");
        assert_eq!(value["optional"], true);
        assert_eq!(value["description"], "Attempts");
        assert!(value.get("default").is_none());
    }

    #[test]
    fn test_provider_schema() {
        let provider_schema = ProviderSchema::new()
            .with_provider_config(
                Schema::v0().with_attribute("password", Attribute::optional_string().sensitive()),
            )
            .with_resource(
                "freeipa_host",
                Schema::v0().with_attribute("fqdn", Attribute::required_string()),
            );

        assert!(provider_schema
            .provider
            .block
            .attributes
            .contains_key("password"));
        assert!(provider_schema.resources.contains_key("freeipa_host"));
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid configuration")
            .with_detail("fqdn must not be empty")
            .with_attribute("fqdn");

        assert!(err.is_error());
        assert_eq!(err.summary, "Invalid configuration");
        assert_eq!(err.detail.as_deref(), Some("fqdn must not be empty"));
        assert_eq!(err.attribute.as_deref(), Some("fqdn"));

        assert!(!has_errors(&[Diagnostic::warning("deprecated")]));
        assert!(has_errors(&[Diagnostic::warning("deprecated"), err]));
    }
}
