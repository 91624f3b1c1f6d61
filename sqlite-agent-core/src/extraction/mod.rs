use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::providers::types::parse_json_content;
use crate::providers::{ChatMessage, GenerateOptions, ModelProvider, StructuredSchema};

pub const EXTRACTION_DIRECTIVE: &str = "You are an expert extraction algorithm. \
Only extract relevant information from the text. \
If you do not know the value of an attribute asked to extract, \
return null for the attribute's value.";

/// A record shape the model can be asked to fill from free text.
/// `Default` is the all-absent instance returned when nothing usable comes back.
pub trait ExtractionSchema: DeserializeOwned + Default + Send {
    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn json_schema() -> Value;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    #[serde(deserialize_with = "lenient::text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient::integer")]
    pub age: Option<i64>,
}

impl ExtractionSchema for UserInfo {
    const NAME: &'static str = "UserInfo";
    const DESCRIPTION: &'static str = "Information about a user.";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": ["string", "null"], "description": "The name of the user" },
                "email": { "type": ["string", "null"], "description": "The email address of the user" },
                "age": { "type": ["integer", "null"], "description": "The age of the user" }
            },
            "required": ["name", "email", "age"],
            "additionalProperties": false
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductInfo {
    #[serde(deserialize_with = "lenient::text")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::number")]
    pub price: Option<f64>,
    #[serde(deserialize_with = "lenient::integer")]
    pub quantity: Option<i64>,
}

impl ProductInfo {
    pub fn quantity(&self) -> i64 {
        self.quantity.unwrap_or(1)
    }
}

impl ExtractionSchema for ProductInfo {
    const NAME: &'static str = "ProductInfo";
    const DESCRIPTION: &'static str = "Information about a product purchase.";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": ["string", "null"], "description": "The name of the product" },
                "price": { "type": ["number", "null"], "description": "The price of the product" },
                "quantity": {
                    "type": ["integer", "null"],
                    "description": "The number of products to purchase",
                    "default": 1
                }
            },
            "required": ["name", "price", "quantity"],
            "additionalProperties": false
        })
    }
}

/// Field decoders for model output. A value is coerced when its meaning is
/// unambiguous (`"30"` for an integer, `2.0` for a count); otherwise only
/// that field is absent and the rest of the record survives.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn dropped(expected: &str, value: &Value) {
        tracing::warn!(expected, %value, "dropping ill-typed extracted field");
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => None,
            Value::String(text) => Some(text),
            other => {
                dropped("string", &other);
                None
            }
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let parsed = match &value {
            Value::Null => return Ok(None),
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|number| number.is_finite());
        if parsed.is_none() {
            dropped("number", &value);
        }
        Ok(parsed)
    }

    pub fn integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let parsed = match &value {
            Value::Null => return Ok(None),
            Value::Number(number) => number.as_i64().or_else(|| number.as_f64().and_then(whole)),
            Value::String(text) => {
                let text = text.trim();
                text.parse::<i64>()
                    .ok()
                    .or_else(|| text.parse::<f64>().ok().and_then(whole))
            }
            _ => None,
        };
        if parsed.is_none() {
            dropped("integer", &value);
        }
        Ok(parsed)
    }

    fn whole(number: f64) -> Option<i64> {
        (number.fract() == 0.0 && number.abs() < 9.0e15).then_some(number as i64)
    }
}

/// Turns free text into a typed record through the provider's structured
/// output mode. Stateless; clones share the provider.
#[derive(Clone)]
pub struct Extractor {
    provider: Arc<dyn ModelProvider>,
    options: GenerateOptions,
}

impl Extractor {
    pub fn new(provider: Arc<dyn ModelProvider>, temperature: f32) -> Self {
        Self {
            provider,
            options: GenerateOptions {
                temperature,
                ..GenerateOptions::default()
            },
        }
    }

    pub async fn extract<T: ExtractionSchema>(&self, text: &str) -> Result<T> {
        if text.trim().is_empty() {
            return Ok(T::default());
        }

        let messages = [
            ChatMessage::system(EXTRACTION_DIRECTIVE),
            ChatMessage::user(text),
        ];
        let schema = StructuredSchema {
            name: T::NAME.to_owned(),
            description: T::DESCRIPTION.to_owned(),
            schema: T::json_schema(),
        };

        let raw = self
            .provider
            .generate_structured(&messages, &schema, &self.options)
            .await?;
        Ok(Self::decode(raw))
    }

    fn decode<T: ExtractionSchema>(raw: Value) -> T {
        let value = match raw {
            Value::String(content) => match parse_json_content(&content) {
                Some(value) => value,
                None => {
                    tracing::warn!(schema = T::NAME, "structured output is not JSON");
                    return T::default();
                }
            },
            Value::Null => return T::default(),
            other => other,
        };

        serde_json::from_value(value).unwrap_or_else(|err| {
            tracing::warn!(schema = T::NAME, %err, "structured output does not match schema");
            T::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::ScriptedProvider;

    fn extractor(provider: &ScriptedProvider) -> Extractor {
        Extractor::new(Arc::new(provider.clone()), 0.0)
    }

    #[tokio::test]
    async fn extracts_user_fields() {
        let provider = ScriptedProvider::default();
        provider.push_structured(
            "UserInfo",
            json!({"name": "Tedy Tsao", "email": "dkk94729@gmail.com", "age": 22}),
        );

        let info: UserInfo = extractor(&provider)
            .extract("A new member, Tedy Tsao, 22, dkk94729@gmail.com")
            .await
            .expect("extract");

        assert_eq!(info.name.as_deref(), Some("Tedy Tsao"));
        assert_eq!(info.age, Some(22));
    }

    #[tokio::test]
    async fn text_without_information_yields_all_absent() {
        let provider = ScriptedProvider::default();
        provider.push_structured("UserInfo", json!({"name": null, "email": null, "age": null}));

        let info: UserInfo = extractor(&provider)
            .extract("hello there")
            .await
            .expect("extract");
        assert_eq!(info, UserInfo::default());

        let empty: ProductInfo = extractor(&provider).extract("   ").await.expect("extract");
        assert_eq!(empty, ProductInfo::default());
    }

    #[tokio::test]
    async fn ill_typed_fields_do_not_discard_the_record() {
        let provider = ScriptedProvider::default();
        provider.push_structured(
            "UserInfo",
            json!({"name": "Bob Smith", "email": "bob@x.com", "age": "30"}),
        );
        provider.push_structured(
            "ProductInfo",
            json!({"name": 42, "price": "999.99", "quantity": 2.0}),
        );
        provider.push_structured("ProductInfo", json!({"name": "Laptop", "quantity": "many"}));
        let extractor = extractor(&provider);

        let user: UserInfo = extractor.extract("Bob Smith, 30, bob@x.com").await.expect("extract");
        assert_eq!(
            user,
            UserInfo {
                name: Some("Bob Smith".to_owned()),
                email: Some("bob@x.com".to_owned()),
                age: Some(30),
            }
        );

        let product: ProductInfo = extractor.extract("two of them").await.expect("extract");
        assert_eq!(product.name, None);
        assert_eq!(product.price, Some(999.99));
        assert_eq!(product.quantity, Some(2));

        let product: ProductInfo = extractor.extract("some laptops").await.expect("extract");
        assert_eq!(product.name.as_deref(), Some("Laptop"));
        assert_eq!(product.quantity, None);
        assert_eq!(product.quantity(), 1);
    }

    #[tokio::test]
    async fn non_object_output_falls_back_to_default() {
        let provider = ScriptedProvider::default();
        provider.push_structured("UserInfo", json!(17));

        let info: UserInfo = extractor(&provider).extract("who?").await.expect("extract");
        assert_eq!(info, UserInfo::default());
    }

    #[tokio::test]
    async fn string_output_is_parsed_as_json() {
        let provider = ScriptedProvider::default();
        provider.push_structured(
            "ProductInfo",
            json!("```json\n{\"name\": \"Laptop\", \"quantity\": 3}\n```"),
        );

        let info: ProductInfo = extractor(&provider)
            .extract("I want to buy 3 Laptops")
            .await
            .expect("extract");
        assert_eq!(info.name.as_deref(), Some("Laptop"));
        assert_eq!(info.quantity(), 3);
    }
}
