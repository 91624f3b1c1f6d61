//! Turns tool-script source into a [`ToolSpec`].
//!
//! Loading runs in five steps: scan for the `structured_tool(...)`
//! expression, assemble a fresh namespace, execute the source, resolve the
//! named function and schema, and wrap the function as a tool handler.
//! Nothing here touches a registry; the caller registers the result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::schema::LoaderConfig;
use crate::error::{Error, Result};
use crate::extraction::{Extractor, ProductInfo, UserInfo};
use crate::script::builtins::{HOST_BUILTINS, PURE_BUILTINS};
use crate::script::interpreter::{ExtractKind, Limits, Machine, Namespace, ScriptHost};
use crate::script::lexer::tokenize;
use crate::script::parser::Parser;
use crate::script::scan::scan_tool_definition;
use crate::script::value::{as_schema, builtin_ref, type_name, type_ref};
use crate::storage::DataStore;
use crate::tools::output::ToolOutput;
use crate::tools::types::{FieldKind, ToolHandler, ToolSpec};

/// Runs ahead of every tool source so `db` is always bound.
const PRELUDE: &str = "let db = data_store();";

pub struct ToolLoader {
    host: Arc<LoaderHost>,
    config: LoaderConfig,
}

impl ToolLoader {
    pub fn new(store: Arc<dyn DataStore>, extractor: Extractor, config: LoaderConfig) -> Self {
        Self {
            host: Arc::new(LoaderHost { store, extractor }),
            config,
        }
    }

    pub async fn load(&self, source: &str) -> Result<ToolSpec> {
        let definition = scan_tool_definition(source, self.config.max_source_bytes)?;
        tracing::debug!(
            tool = %definition.name,
            func = %definition.func,
            args_schema = %definition.args_schema,
            line = definition.line,
            "found tool definition"
        );

        // Prelude tokens keep their own line numbers, so errors in the
        // user text are reported against the text as written.
        let mut tokens = tokenize(PRELUDE)?;
        tokens.extend(tokenize(source)?);
        let program = Parser::new(tokens).parse_program()?;

        let limits = Limits::from_config(&self.config);
        let host: Arc<dyn ScriptHost> = self.host.clone();
        let mut machine = Machine::new(host.clone(), limits, preloaded_namespace());
        machine.run(&program).await?;
        let namespace = machine.into_namespace();

        let function = match namespace.function(&definition.func) {
            Some(def) => def.name.clone(),
            None => {
                return Err(match namespace.get(&definition.func) {
                    Some(value) => Error::ToolExecution(format!(
                        "'{}' is a {}, not a function",
                        definition.func,
                        type_name(value)
                    )),
                    None => Error::UnresolvedSymbol {
                        kind: "function",
                        symbol: definition.func,
                    },
                })
            }
        };

        let schema = match namespace.get(&definition.args_schema) {
            Some(value) => as_schema(value).ok_or_else(|| {
                Error::ToolExecution(format!(
                    "'{}' is a {}, not a schema",
                    definition.args_schema,
                    type_name(value)
                ))
            })?,
            None => {
                return Err(Error::UnresolvedSymbol {
                    kind: "schema",
                    symbol: definition.args_schema,
                })
            }
        };

        tracing::info!(tool = %definition.name, fields = schema.fields.len(), "loaded tool");
        let handler = ScriptTool {
            host,
            limits,
            namespace: Arc::new(namespace),
            function,
        };
        Ok(
            ToolSpec::new(definition.name, definition.description, schema, Arc::new(handler))
                .return_direct(true),
        )
    }
}

/// Symbols every load starts from. Nothing survives from earlier loads.
fn preloaded_namespace() -> Namespace {
    let mut namespace = Namespace::default();
    for name in HOST_BUILTINS.iter().chain(PURE_BUILTINS.iter()) {
        namespace.define(name, builtin_ref(name));
    }
    for kind in [
        FieldKind::String,
        FieldKind::Integer,
        FieldKind::Number,
        FieldKind::Boolean,
    ] {
        namespace.define(kind.as_str(), type_ref(kind));
    }
    namespace
}

/// A loaded script function. Every call runs on its own copy of the
/// namespace the load produced, under the same budgets.
struct ScriptTool {
    host: Arc<dyn ScriptHost>,
    limits: Limits,
    namespace: Arc<Namespace>,
    function: String,
}

#[async_trait]
impl ToolHandler for ScriptTool {
    async fn call(&self, args: Value) -> Result<ToolOutput> {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut machine = Machine::new(
            self.host.clone(),
            self.limits,
            Namespace::clone(&self.namespace),
        );
        let value = machine.call_function(&self.function, &args).await?;
        Ok(ToolOutput::from_value(value))
    }
}

/// Bridges script calls to the data store and the extractor.
struct LoaderHost {
    store: Arc<dyn DataStore>,
    extractor: Extractor,
}

fn text_arg(method: &str, args: &[Value], index: usize, param: &str) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Validation(format!("{method}: '{param}' must be a string")))
}

fn optional_text_arg(args: &[Value], index: usize) -> Option<String> {
    args.get(index).and_then(Value::as_str).map(str::to_owned)
}

fn integer_arg(method: &str, args: &[Value], index: usize, param: &str) -> Result<i64> {
    optional_integer_arg(args, index)
        .ok_or_else(|| Error::Validation(format!("{method}: '{param}' must be an integer")))
}

fn optional_integer_arg(args: &[Value], index: usize) -> Option<i64> {
    let value = args.get(index)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|n| n.fract() == 0.0).map(|n| n as i64))
}

fn number_arg(method: &str, args: &[Value], index: usize, param: &str) -> Result<f64> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Validation(format!("{method}: '{param}' must be a number")))
}

#[async_trait]
impl ScriptHost for LoaderHost {
    async fn call_store(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let store = &self.store;
        let value = match method {
            "insert_member" => {
                let name = text_arg(method, &args, 0, "name")?;
                let email = optional_text_arg(&args, 1);
                let age = optional_integer_arg(&args, 2);
                json!(store.insert_member(&name, email.as_deref(), age).await?)
            }
            "insert_product" => {
                let name = text_arg(method, &args, 0, "name")?;
                let price = number_arg(method, &args, 1, "price")?;
                json!(store.insert_product(&name, price).await?)
            }
            "insert_record" => {
                let member_id = integer_arg(method, &args, 0, "member_id")?;
                let product_id = integer_arg(method, &args, 1, "product_id")?;
                let quantity = optional_integer_arg(&args, 2).unwrap_or(1);
                json!(store.insert_record(member_id, product_id, quantity).await?)
            }
            "get_member_by_name" => {
                let name = text_arg(method, &args, 0, "name")?;
                serde_json::to_value(store.get_member_by_name(&name).await?)?
            }
            "get_product_by_name" => {
                let name = text_arg(method, &args, 0, "name")?;
                serde_json::to_value(store.get_product_by_name(&name).await?)?
            }
            "get_member_records" => {
                let member_id = integer_arg(method, &args, 0, "member_id")?;
                serde_json::to_value(store.get_member_records(member_id).await?)?
            }
            "list_all_members" => serde_json::to_value(store.list_all_members().await?)?,
            "list_all_products" => serde_json::to_value(store.list_all_products().await?)?,
            "list_all_records" => serde_json::to_value(store.list_all_records().await?)?,
            other => return Err(Error::NotFound(format!("data store method '{other}'"))),
        };
        Ok(value)
    }

    async fn extract(&self, kind: ExtractKind, text: &str) -> Result<Value> {
        match kind {
            ExtractKind::User => {
                let user: UserInfo = self.extractor.extract(text).await?;
                Ok(serde_json::to_value(user)?)
            }
            ExtractKind::Product => {
                let mut product: ProductInfo = self.extractor.extract(text).await?;
                product.quantity = Some(product.quantity());
                Ok(serde_json::to_value(product)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::ScriptedProvider;
    use crate::script::INSERT_PRODUCT_EXAMPLE;
    use crate::storage::SqliteStore;

    struct Fixture {
        provider: ScriptedProvider,
        store: Arc<SqliteStore>,
        loader: ToolLoader,
    }

    fn fixture_with(config: LoaderConfig) -> Fixture {
        let provider = ScriptedProvider::default();
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        let extractor = Extractor::new(Arc::new(provider.clone()), 0.0);
        let loader = ToolLoader::new(store.clone(), extractor, config);
        Fixture {
            provider,
            store,
            loader,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(LoaderConfig::default())
    }

    const ECHO_TOOL: &str = r#"
schema EchoInput {
    text: string "Text to echo",
    times: integer? = 1,
}

fn echo(text, times) {
    let parts = []
    let i = 0
    while i < times {
        parts = parts.push(text)
        i = i + 1
    }
    return parts.join(" ")
}

structured_tool(
    func = echo,
    name = "EchoTool",
    description = "Repeats the text. Keep \"quotes\" as they are.",
    args_schema = EchoInput,
)
"#;

    #[tokio::test]
    async fn loads_tool_with_literal_name_and_description() {
        let fixture = fixture();
        let tool = fixture.loader.load(ECHO_TOOL).await.expect("load");

        assert_eq!(tool.name, "EchoTool");
        assert_eq!(tool.description, "Repeats the text. Keep \"quotes\" as they are.");
        assert!(tool.return_direct);
        assert_eq!(tool.schema.name, "EchoInput");
        assert_eq!(tool.schema.fields.len(), 2);

        let output = tool
            .invoke(json!({"text": "hi", "times": 3}))
            .await
            .expect("invoke");
        assert_eq!(output, ToolOutput::text("hi hi hi"));

        let defaulted = tool.invoke(json!({"text": "once"})).await.expect("invoke");
        assert_eq!(defaulted, ToolOutput::text("once"));
    }

    #[tokio::test]
    async fn arguments_are_validated_against_the_schema() {
        let fixture = fixture();
        let tool = fixture.loader.load(ECHO_TOOL).await.expect("load");
        let err = tool.invoke(json!({"times": 2})).await.expect_err("missing text");
        assert!(matches!(err, Error::Validation(_)), "{err:?}");
    }

    #[tokio::test]
    async fn source_without_single_definition_is_malformed() {
        let fixture = fixture();
        let none = "fn f(text) { return text }";
        assert!(matches!(
            fixture.loader.load(none).await,
            Err(Error::MalformedTool(_))
        ));

        let twice = format!("{ECHO_TOOL}\n{ECHO_TOOL}");
        assert!(matches!(
            fixture.loader.load(&twice).await,
            Err(Error::MalformedTool(_))
        ));
    }

    #[tokio::test]
    async fn missing_symbols_are_unresolved() {
        let fixture = fixture();
        let no_function = "schema S { text: string }\nstructured_tool(func = nope, name = \"T\", description = \"d\", args_schema = S)";
        let err = fixture.loader.load(no_function).await.expect_err("unresolved");
        assert!(
            matches!(&err, Error::UnresolvedSymbol { kind: "function", symbol } if symbol == "nope"),
            "{err:?}"
        );

        let no_schema = "fn f(text) { return text }\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = Missing)";
        let err = fixture.loader.load(no_schema).await.expect_err("unresolved");
        assert!(
            matches!(&err, Error::UnresolvedSymbol { kind: "schema", symbol } if symbol == "Missing"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn wrong_symbol_kind_is_an_execution_error() {
        let fixture = fixture();
        let source = "fn f(text) { return text }\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = f)";
        let err = fixture.loader.load(source).await.expect_err("not a schema");
        assert!(matches!(err, Error::ToolExecution(_)), "{err:?}");
    }

    #[tokio::test]
    async fn runtime_errors_report_user_line_numbers() {
        let fixture = fixture();
        let source = "fn f(text) { return text }\nlet broken = 1 / 0\nschema S { text: string }\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = S)";
        let Err(Error::ToolExecution(message)) = fixture.loader.load(source).await else {
            panic!("expected execution error");
        };
        assert!(message.contains("line 2"), "{message}");
        assert!(message.contains("division by zero"), "{message}");

        let syntax = "fn f(text) { return text\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = S)";
        assert!(matches!(
            fixture.loader.load(syntax).await,
            Err(Error::ToolExecution(_))
        ));
    }

    #[tokio::test]
    async fn runaway_source_exhausts_budget() {
        let fixture = fixture_with(LoaderConfig {
            max_steps: 1_000,
            ..LoaderConfig::default()
        });
        let source = "while true { }\nfn f(text) { return text }\nschema S { text: string }\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = S)";
        let Err(Error::ToolExecution(message)) = fixture.loader.load(source).await else {
            panic!("expected budget error");
        };
        assert!(message.contains("budget exceeded"), "{message}");
    }

    #[tokio::test]
    async fn each_load_gets_a_fresh_namespace() {
        let fixture = fixture();
        let first = "let shared = 1\nfn f(text) { return text }\nschema S { text: string }\nstructured_tool(func = f, name = \"A\", description = \"d\", args_schema = S)";
        fixture.loader.load(first).await.expect("first load");

        let second = "let copy = shared\nfn g(text) { return text }\nschema S { text: string }\nstructured_tool(func = g, name = \"B\", description = \"d\", args_schema = S)";
        let Err(Error::ToolExecution(message)) = fixture.loader.load(second).await else {
            panic!("expected undefined name");
        };
        assert!(message.contains("shared"), "{message}");
    }

    #[tokio::test]
    async fn errors_raised_during_a_call_surface_as_execution_errors() {
        let fixture = fixture();
        let source = "schema S { text: string }\nfn f(text) { return length(text) / 0 }\nstructured_tool(func = f, name = \"T\", description = \"d\", args_schema = S)";
        let tool = fixture.loader.load(source).await.expect("load");
        let err = tool.invoke(json!({"text": "x"})).await.expect_err("division");
        assert!(matches!(err, Error::ToolExecution(_)), "{err:?}");
    }

    #[tokio::test]
    async fn store_listings_become_tables() {
        let fixture = fixture();
        let source = "schema Empty { }\nfn products() { return db.list_all_products() }\nstructured_tool(func = products, name = \"Products\", description = \"d\", args_schema = Empty)";
        let tool = fixture.loader.load(source).await.expect("load");
        let ToolOutput::Table(table) = tool.invoke(Value::Null).await.expect("invoke") else {
            panic!("expected table");
        };
        assert_eq!(table.columns, ["id", "name", "price"]);
        assert_eq!(table.rows.len(), 3);
    }

    #[tokio::test]
    async fn insert_product_example_writes_to_the_store() {
        let fixture = fixture();
        let tool = fixture
            .loader
            .load(INSERT_PRODUCT_EXAMPLE)
            .await
            .expect("load example");
        assert_eq!(tool.name, "InsertProduct");

        fixture.provider.push_structured(
            "ProductInfo",
            json!({"name": "Tablet", "price": 299.5, "quantity": null}),
        );
        let output = tool
            .invoke(json!({"text": "Add a Tablet that costs 299.50"}))
            .await
            .expect("invoke");
        assert_eq!(
            output,
            ToolOutput::text("Inserted product Tablet (ID: 4, price: 299.5)")
        );

        let product = fixture
            .store
            .get_product_by_name("Tablet")
            .await
            .expect("query")
            .expect("inserted");
        assert_eq!(product.price, 299.5);

        fixture.provider.push_structured(
            "ProductInfo",
            json!({"name": "Laptop", "price": 1.0, "quantity": null}),
        );
        let output = tool
            .invoke(json!({"text": "Add a Laptop for 1 dollar"}))
            .await
            .expect("invoke");
        assert_eq!(
            output,
            ToolOutput::text("Product Laptop already exists with ID: 1")
        );
        assert_eq!(fixture.store.list_all_products().await.expect("list").len(), 4);
    }
}
