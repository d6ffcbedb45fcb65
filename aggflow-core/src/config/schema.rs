use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::value::ValueType;

const DEFAULT_KEY_FIELD: &str = "key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Flattened payload field holding the grouping key. Always required.
    pub key_field: String,
    pub fields: Vec<FieldSpec>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            key_field: DEFAULT_KEY_FIELD.to_string(),
            fields: vec![],
        }
    }
}

impl SchemaConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_field.is_empty() {
            return Err(Error::Config("schema.key_field must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Flattened (dotted) field name.
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: false,
        }
    }
}
