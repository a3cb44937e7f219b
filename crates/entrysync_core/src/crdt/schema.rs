//! Attribute schemas for entry types.
//!
//! A schema declares which attributes an entry type carries and how each one
//! is represented inside the CRDT document. The representation decides the
//! merge behavior: scalar and [`FieldType::Json`] values are last-writer-wins
//! per key, [`FieldType::Text`] is a collaborative text merged character by
//! character, and [`FieldType::Object`] / [`FieldType::Record`] are nested
//! maps merged key by key.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::types::{Attributes, TYPE_ATTRIBUTE};

/// How an attribute is stored in the CRDT document.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// JSON string, last-writer-wins
    String,
    /// JSON number, last-writer-wins
    Number,
    /// JSON boolean, last-writer-wins
    Boolean,
    /// Any JSON value stored opaquely, last-writer-wins
    Json,
    /// Collaborative text
    Text,
    /// Nested map with declared fields
    Object(AttributeSchema),
    /// Nested map with free keys, every value of the given type
    Record(Box<FieldType>),
}

impl FieldType {
    /// Shorthand for `FieldType::Record(Box::new(inner))`.
    pub fn record(inner: FieldType) -> Self {
        FieldType::Record(Box::new(inner))
    }

    fn check(&self, path: &str, value: &Value) -> Result<()> {
        let ok = match self {
            FieldType::String | FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Json => true,
            FieldType::Object(schema) => {
                let object = value.as_object().ok_or_else(|| mismatch(path, "an object"))?;
                return schema.validate_at(path, object);
            }
            FieldType::Record(inner) => {
                let object = value.as_object().ok_or_else(|| mismatch(path, "an object"))?;
                for (key, item) in object {
                    if !item.is_null() {
                        inner.check(&format!("{}.{}", path, key), item)?;
                    }
                }
                return Ok(());
            }
        };

        if ok {
            Ok(())
        } else {
            Err(mismatch(path, self.expected()))
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Text => "a string",
            FieldType::Number => "a number",
            FieldType::Boolean => "a boolean",
            FieldType::Json => "any value",
            FieldType::Object(_) | FieldType::Record(_) => "an object",
        }
    }
}

fn mismatch(path: &str, expected: &str) -> SyncError {
    SyncError::InvalidAttributes(format!("'{}' must be {}", path, expected))
}

/// Declaration of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Storage representation
    pub field_type: FieldType,
    /// Whether a non-null value must be present
    pub required: bool,
}

/// The set of attributes an entry type (or nested object) accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSchema {
    fields: BTreeMap<String, FieldSchema>,
}

impl AttributeSchema {
    /// An empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required attribute (builder pattern).
    pub fn required(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                field_type,
                required: true,
            },
        );
        self
    }

    /// Declare an optional attribute (builder pattern).
    pub fn optional(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                field_type,
                required: false,
            },
        );
        self
    }

    /// Look up an attribute declaration.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Iterate declarations in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSchema)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    /// Check `attributes` against the schema.
    ///
    /// Null values are treated as absent. Unknown attributes are rejected.
    pub fn validate(&self, attributes: &Attributes) -> Result<()> {
        self.validate_at("", attributes)
    }

    fn validate_at(&self, prefix: &str, attributes: &Attributes) -> Result<()> {
        let path = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            }
        };

        if let Some(unknown) = attributes.keys().find(|key| !self.fields.contains_key(*key)) {
            return Err(SyncError::InvalidAttributes(format!(
                "unknown attribute '{}'",
                path(unknown.as_str())
            )));
        }

        for (name, field) in &self.fields {
            match attributes.get(name).filter(|v| !v.is_null()) {
                Some(value) => field.field_type.check(&path(name.as_str()), value)?,
                None if field.required => {
                    return Err(SyncError::InvalidAttributes(format!(
                        "missing required attribute '{}'",
                        path(name.as_str())
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Maps entry type names to their schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, AttributeSchema>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in entry types: `space`, `folder`, `page`,
    /// `database` and `record`.
    pub fn with_defaults() -> Self {
        let field_definition = AttributeSchema::new()
            .required("name", FieldType::String)
            .required("type", FieldType::String)
            .optional("options", FieldType::Json);

        Self::new()
            .with(
                "space",
                AttributeSchema::new()
                    .required("name", FieldType::String)
                    .optional("description", FieldType::String)
                    .optional("avatar", FieldType::String),
            )
            .with(
                "folder",
                AttributeSchema::new()
                    .required("name", FieldType::String)
                    .required("parentId", FieldType::String)
                    .optional("avatar", FieldType::String),
            )
            .with(
                "page",
                AttributeSchema::new()
                    .required("name", FieldType::String)
                    .optional("parentId", FieldType::String)
                    .optional("content", FieldType::Text),
            )
            .with(
                "database",
                AttributeSchema::new()
                    .required("name", FieldType::String)
                    .required("parentId", FieldType::String)
                    .optional("fields", FieldType::record(FieldType::Object(field_definition))),
            )
            .with(
                "record",
                AttributeSchema::new()
                    .required("name", FieldType::String)
                    .required("parentId", FieldType::String)
                    .required("databaseId", FieldType::String)
                    .optional("fields", FieldType::record(FieldType::Json)),
            )
    }

    /// Register a schema (builder pattern). See [`SchemaRegistry::register`].
    pub fn with(mut self, entry_type: &str, schema: AttributeSchema) -> Self {
        self.register(entry_type, schema);
        self
    }

    /// Register the schema for `entry_type`.
    ///
    /// The `type` attribute is always declared as a required string.
    pub fn register(&mut self, entry_type: &str, schema: AttributeSchema) {
        let schema = schema.required(TYPE_ATTRIBUTE, FieldType::String);
        self.schemas.insert(entry_type.to_string(), schema);
    }

    /// Schema registered for `entry_type`.
    pub fn get(&self, entry_type: &str) -> Option<&AttributeSchema> {
        self.schemas.get(entry_type)
    }

    /// Resolve the schema for a set of attributes from its `type` attribute.
    pub fn schema_for(&self, attributes: &Attributes) -> Result<&AttributeSchema> {
        let entry_type = attributes
            .get(TYPE_ATTRIBUTE)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SyncError::InvalidAttributes("missing required attribute 'type'".to_string())
            })?;

        self.get(entry_type).ok_or_else(|| {
            SyncError::InvalidAttributes(format!("unknown entry type '{}'", entry_type))
        })
    }
}
