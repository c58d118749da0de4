//! Setting definitions, values, and the serialized document shape.

use serde::{Deserialize, Serialize};

/// Expected type of a setting value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Int,
    Bool,
    Float,
}

impl ValueType {
    /// Whether `value` parses as this type.
    pub fn accepts(&self, value: &str) -> bool {
        match self {
            ValueType::String => true,
            ValueType::Int => value.trim().parse::<i64>().is_ok(),
            ValueType::Bool => matches!(value.trim(), "true" | "false"),
            ValueType::Float => value.trim().parse::<f64>().is_ok(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Static description of a setting, loaded once from the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingDefinition {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub secret: bool,
}

/// A path/value pair. This is also the payload of a change notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettingValue {
    pub path: String,
    pub value: String,
}

impl SettingValue {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }
}

/// A current value paired with its definition, when one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub path: String,
    pub value: String,
    pub definition: Option<SettingDefinition>,
}

/// On-disk shape of both the packaged template and the override file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub definitions: Vec<SettingDefinition>,
    #[serde(default)]
    pub values: Vec<SettingValue>,
}

impl SettingsDocument {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_type_accepts() {
        assert!(ValueType::Int.accepts("50222"));
        assert!(!ValueType::Int.accepts("fifty"));
        assert!(ValueType::Bool.accepts("true"));
        assert!(!ValueType::Bool.accepts("yes"));
        assert!(ValueType::Float.accepts("1.5"));
        assert!(ValueType::String.accepts(""));
    }

    #[test]
    fn test_document_defaults() {
        let doc = SettingsDocument::from_yaml(
            "definitions:\n  - path: /services/a\nvalues:\n  - path: /services/a\n    value: x\n",
        )
        .unwrap();
        let def = &doc.definitions[0];
        assert!(def.editable);
        assert!(!def.secret);
        assert_eq!(def.value_type, ValueType::String);
        assert_eq!(doc.values[0].value, "x");
    }

    #[test]
    fn test_empty_document() {
        let doc = SettingsDocument::from_yaml("{}").unwrap();
        assert!(doc.definitions.is_empty());
        assert!(doc.values.is_empty());
    }
}
