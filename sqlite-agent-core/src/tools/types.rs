use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::providers::ToolDeclaration;
use crate::tools::output::ToolOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl FieldKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub kind: FieldKind,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
}

/// Named, ordered set of typed input fields for a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl InputSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a required field.
    pub fn field(mut self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.fields.push(SchemaField {
            name: name.to_owned(),
            kind,
            description: Some(description.to_owned()),
            required: true,
            default: None,
        });
        self
    }

    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let mut property = Map::new();
            property.insert("type".to_owned(), json!(field.kind.as_str()));
            if let Some(description) = &field.description {
                property.insert("description".to_owned(), json!(description));
            }
            if let Some(default) = &field.default {
                property.insert("default".to_owned(), default.clone());
            }
            properties.insert(field.name.clone(), Value::Object(property));
        }

        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.as_str())
            .collect();

        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Normalizes `args` to an object, fills declared defaults and checks
    /// the result against the JSON schema.
    pub fn prepare_arguments(&self, args: Value) -> Result<Value> {
        let mut object = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Validation(format!(
                    "arguments for '{}' must be an object, got {other}",
                    self.name
                )))
            }
        };

        for field in &self.fields {
            if let Some(default) = &field.default {
                object
                    .entry(field.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        let value = Value::Object(object);
        let schema = self.to_json_schema();
        let compiled = JSONSchema::compile(&schema)
            .map_err(|err| Error::Validation(format!("invalid input schema '{}': {err}", self.name)))?;

        if let Err(errors) = compiled.validate(&value) {
            return Err(Error::Validation(format!(
                "arguments do not match '{}': {}",
                self.name,
                errors.map(|err| err.to_string()).collect::<Vec<_>>().join(", ")
            )));
        }

        Ok(value)
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Result<ToolOutput>;
}

/// A callable tool as the registry stores it. Clones share the handler.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: InputSchema,
    pub return_direct: bool,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: InputSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            return_direct: false,
            handler,
        }
    }

    pub fn return_direct(mut self, return_direct: bool) -> Self {
        self.return_direct = return_direct;
        self
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }

    pub async fn invoke(&self, args: Value) -> Result<ToolOutput> {
        let args = self.schema.prepare_arguments(args)?;
        tracing::debug!(tool = %self.name, "invoking tool");
        self.handler.call(args).await
    }
}

impl fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema.name)
            .field("return_direct", &self.return_direct)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_schema() -> InputSchema {
        let mut schema = InputSchema::new("InsertProductInput")
            .field("name", FieldKind::String, "Product name")
            .field("price", FieldKind::Number, "Unit price");
        schema.fields.push(SchemaField {
            name: "stock".to_owned(),
            kind: FieldKind::Integer,
            description: None,
            required: false,
            default: Some(json!(0)),
        });
        schema
    }

    #[test]
    fn renders_ordered_json_schema() {
        let schema = product_schema().to_json_schema();
        let keys: Vec<&String> = schema["properties"]
            .as_object()
            .expect("properties")
            .keys()
            .collect();

        assert_eq!(keys, ["name", "price", "stock"]);
        assert_eq!(schema["required"], json!(["name", "price"]));
        assert_eq!(schema["properties"]["stock"]["default"], json!(0));
    }

    #[test]
    fn fills_defaults_and_validates() {
        let args = product_schema()
            .prepare_arguments(json!({"name": "Tablet", "price": 299.5}))
            .expect("valid");
        assert_eq!(args["stock"], json!(0));

        let err = product_schema()
            .prepare_arguments(json!({"name": "Tablet"}))
            .expect_err("missing price");
        assert!(matches!(err, Error::Validation(_)));

        let err = product_schema()
            .prepare_arguments(json!({"name": "Tablet", "price": "cheap"}))
            .expect_err("wrong type");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn null_arguments_become_empty_object() {
        let args = InputSchema::new("Empty")
            .prepare_arguments(Value::Null)
            .expect("valid");
        assert_eq!(args, json!({}));
    }
}
