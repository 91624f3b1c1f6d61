//! Tools every session starts with.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::extraction::{Extractor, ProductInfo, UserInfo};
use crate::storage::DataStore;
use crate::tools::output::{Table, ToolOutput};
use crate::tools::types::{FieldKind, InputSchema, ToolHandler, ToolSpec};

const USER_INCOMPLETE: &str = "User information is incomplete.";
const PRODUCT_INCOMPLETE: &str = "Product information is incomplete.";

pub fn default_tools(store: Arc<dyn DataStore>, extractor: Extractor) -> Vec<ToolSpec> {
    let text_input = |name: &str, description: &str| {
        InputSchema::new(name).field("text", FieldKind::String, description)
    };

    vec![
        ToolSpec::new(
            "ExtractAndWriteUserInfo",
            "Extract user information from text and write it to SQLite database",
            text_input("ExtractAndWriteInput", "The text containing user information"),
            Arc::new(ExtractAndWriteUserInfo {
                store: store.clone(),
                extractor: extractor.clone(),
            }),
        )
        .return_direct(true),
        ToolSpec::new(
            "PurchaseRecordFetcher",
            "Extract user information from text and fetch purchase records from SQLite database",
            text_input("PurchaseRecordInput", "The text containing user information"),
            Arc::new(PurchaseRecordFetcher {
                store: store.clone(),
                extractor: extractor.clone(),
            }),
        )
        .return_direct(true),
        ToolSpec::new(
            "Purchase",
            "Extract user and purchase information from text and execute the purchase",
            text_input(
                "PurchaseInput",
                "The text containing user and purchase information",
            ),
            Arc::new(Purchase {
                store: store.clone(),
                extractor,
            }),
        )
        .return_direct(true),
        ToolSpec::new(
            "ViewAllProducts",
            "View all products in database if user asks about products' information",
            InputSchema::new("ViewAllProductsInput"),
            Arc::new(ViewAllProducts {
                store: store.clone(),
            }),
        )
        .return_direct(true),
        ToolSpec::new(
            "ViewAllMembers",
            "View all members in database to answer the user if user asks about members' information",
            InputSchema::new("ViewAllMembersInput"),
            Arc::new(ViewAllMembers { store }),
        )
        .return_direct(true),
    ]
}

fn text_argument(args: &Value) -> &str {
    args.get("text").and_then(Value::as_str).unwrap_or_default()
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty())
}

struct ExtractAndWriteUserInfo {
    store: Arc<dyn DataStore>,
    extractor: Extractor,
}

#[async_trait]
impl ToolHandler for ExtractAndWriteUserInfo {
    async fn call(&self, args: Value) -> Result<ToolOutput> {
        let user: UserInfo = self.extractor.extract(text_argument(&args)).await?;
        let Some(name) = present(user.name) else {
            return Ok(ToolOutput::text(USER_INCOMPLETE));
        };

        if let Some(member) = self.store.get_member_by_name(&name).await? {
            return Ok(ToolOutput::text(format!(
                "Member {name} already exists with ID: {}",
                member.id
            )));
        }

        self.store
            .insert_member(&name, user.email.as_deref(), user.age)
            .await?;
        let written = self
            .store
            .get_member_by_name(&name)
            .await?
            .map(|member| member.to_string())
            .unwrap_or_else(|| name.clone());
        Ok(ToolOutput::text(format!(
            "Extracted and wrote user info: {written}"
        )))
    }
}

struct PurchaseRecordFetcher {
    store: Arc<dyn DataStore>,
    extractor: Extractor,
}

#[async_trait]
impl ToolHandler for PurchaseRecordFetcher {
    async fn call(&self, args: Value) -> Result<ToolOutput> {
        let user: UserInfo = self.extractor.extract(text_argument(&args)).await?;
        let Some(name) = present(user.name) else {
            return Ok(ToolOutput::text(USER_INCOMPLETE));
        };

        let Some(member) = self.store.get_member_by_name(&name).await? else {
            return Ok(ToolOutput::text(format!("No member found for name '{name}'")));
        };

        let records = self.store.get_member_records(member.id).await?;
        if records.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No purchase records found for member {name} (ID: {})",
                member.id
            )));
        }

        let mut response = format!("Purchase records for {name} (ID: {}):\n", member.id);
        for record in &records {
            let _ = writeln!(
                response,
                "- Record ID: {}, Product: {}, Price: {:.2}, Number: {}, Payment: {:.2}",
                record.record_id, record.product_name, record.price, record.quantity, record.payment
            );
        }
        Ok(ToolOutput::Text(response))
    }
}

struct Purchase {
    store: Arc<dyn DataStore>,
    extractor: Extractor,
}

#[async_trait]
impl ToolHandler for Purchase {
    async fn call(&self, args: Value) -> Result<ToolOutput> {
        let text = text_argument(&args);
        let (user, product) = tokio::try_join!(
            self.extractor.extract::<UserInfo>(text),
            self.extractor.extract::<ProductInfo>(text),
        )?;

        let Some(member_name) = present(user.name.clone()) else {
            return Ok(ToolOutput::text(USER_INCOMPLETE));
        };
        let quantity = product.quantity();
        let Some(product_name) = present(product.name) else {
            return Ok(ToolOutput::text(PRODUCT_INCOMPLETE));
        };

        let member_id = match self.store.get_member_by_name(&member_name).await? {
            Some(member) => member.id,
            None => {
                tracing::info!(member = %member_name, "purchase by unknown member, registering");
                self.store
                    .insert_member(&member_name, user.email.as_deref(), user.age)
                    .await?
            }
        };

        let Some(item) = self.store.get_product_by_name(&product_name).await? else {
            return Ok(ToolOutput::text(format!(
                "Sorry, the product '{product_name}' does not exist."
            )));
        };

        self.store.insert_record(member_id, item.id, quantity).await?;
        Ok(ToolOutput::text(format!(
            "Purchase successful! Member {member_name} bought {quantity} {product_name}(s)."
        )))
    }
}

struct ViewAllProducts {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl ToolHandler for ViewAllProducts {
    async fn call(&self, _args: Value) -> Result<ToolOutput> {
        let products = self.store.list_all_products().await?;
        Ok(ToolOutput::Table(Table::from_records(&products)?))
    }
}

struct ViewAllMembers {
    store: Arc<dyn DataStore>,
}

#[async_trait]
impl ToolHandler for ViewAllMembers {
    async fn call(&self, _args: Value) -> Result<ToolOutput> {
        let members = self.store.list_all_members().await?;
        Ok(ToolOutput::Table(Table::from_records(&members)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::ScriptedProvider;
    use crate::storage::SqliteStore;
    use serde_json::json;

    struct Fixture {
        provider: ScriptedProvider,
        store: Arc<SqliteStore>,
        tools: Vec<ToolSpec>,
    }

    fn fixture() -> Fixture {
        let provider = ScriptedProvider::default();
        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        let extractor = Extractor::new(Arc::new(provider.clone()), 0.0);
        let tools = default_tools(store.clone(), extractor);
        Fixture {
            provider,
            store,
            tools,
        }
    }

    impl Fixture {
        fn tool(&self, name: &str) -> &ToolSpec {
            self.tools
                .iter()
                .find(|tool| tool.name == name)
                .expect("default tool")
        }
    }

    #[test]
    fn default_tools_are_return_direct_in_order() {
        let fixture = fixture();
        let names: Vec<&str> = fixture.tools.iter().map(|tool| tool.name.as_str()).collect();

        assert_eq!(
            names,
            [
                "ExtractAndWriteUserInfo",
                "PurchaseRecordFetcher",
                "Purchase",
                "ViewAllProducts",
                "ViewAllMembers"
            ]
        );
        assert!(fixture.tools.iter().all(|tool| tool.return_direct));
    }

    #[tokio::test]
    async fn purchase_of_known_product_inserts_one_record() {
        let fixture = fixture();
        fixture
            .provider
            .push_structured("UserInfo", json!({"name": "Alice Johnson", "email": null, "age": null}));
        fixture
            .provider
            .push_structured("ProductInfo", json!({"name": "Laptop", "price": null, "quantity": null}));

        let before = fixture.store.list_all_records().await.expect("records").len();
        let output = fixture
            .tool("Purchase")
            .invoke(json!({"text": "I am Alice Johnson and I want a Laptop"}))
            .await
            .expect("purchase");

        assert_eq!(
            output,
            ToolOutput::text("Purchase successful! Member Alice Johnson bought 1 Laptop(s).")
        );
        let records = fixture.store.list_all_records().await.expect("records");
        assert_eq!(records.len(), before + 1);
        let last = records.last().expect("new record");
        assert_eq!(last.member_name, "Alice Johnson");
        assert_eq!(last.product_name, "Laptop");
        assert_eq!(last.quantity, 1);
    }

    #[tokio::test]
    async fn purchase_records_the_extracted_quantity() {
        let fixture = fixture();
        fixture
            .provider
            .push_structured("UserInfo", json!({"name": "Bob Smith", "email": null, "age": null}));
        fixture
            .provider
            .push_structured("ProductInfo", json!({"name": "Headphones", "price": null, "quantity": 3}));

        let output = fixture
            .tool("Purchase")
            .invoke(json!({"text": "Bob Smith buys 3 Headphones"}))
            .await
            .expect("purchase");

        assert_eq!(
            output,
            ToolOutput::text("Purchase successful! Member Bob Smith bought 3 Headphones(s).")
        );
        let records = fixture.store.list_all_records().await.expect("records");
        assert_eq!(records.len(), 4);
        let last = records.last().expect("new record");
        assert_eq!(last.member_name, "Bob Smith");
        assert_eq!(last.product_name, "Headphones");
        assert_eq!(last.quantity, 3);

        let purchases = fixture.store.get_member_records(2).await.expect("member records");
        let newest = purchases.last().expect("purchase");
        assert_eq!(newest.quantity, 3);
        assert!((newest.payment - 3.0 * 199.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn purchase_of_unknown_product_writes_no_record() {
        let fixture = fixture();
        fixture
            .provider
            .push_structured("UserInfo", json!({"name": "Andy Tsao"}));
        fixture
            .provider
            .push_structured("ProductInfo", json!({"name": "iPhone16", "quantity": 3}));

        let output = fixture
            .tool("Purchase")
            .invoke(json!({"text": "My name is Andy Tsao, I want to buy 3 iPhone16"}))
            .await
            .expect("purchase");

        assert_eq!(
            output,
            ToolOutput::text("Sorry, the product 'iPhone16' does not exist.")
        );
        assert_eq!(fixture.store.list_all_records().await.expect("records").len(), 3);
    }

    #[tokio::test]
    async fn purchase_without_names_is_incomplete() {
        let fixture = fixture();
        fixture.provider.push_structured("ProductInfo", json!({"name": "Laptop"}));

        let output = fixture
            .tool("Purchase")
            .invoke(json!({"text": "buy a laptop"}))
            .await
            .expect("purchase");
        assert_eq!(output, ToolOutput::text(USER_INCOMPLETE));

        fixture.provider.push_structured("UserInfo", json!({"name": "Bob Smith"}));
        let output = fixture
            .tool("Purchase")
            .invoke(json!({"text": "I am Bob Smith"}))
            .await
            .expect("purchase");
        assert_eq!(output, ToolOutput::text(PRODUCT_INCOMPLETE));
    }

    #[tokio::test]
    async fn extract_and_write_reports_existing_member() {
        let fixture = fixture();
        fixture
            .provider
            .push_structured("UserInfo", json!({"name": "Bob Smith", "email": "bob@example.com", "age": 30}));

        let output = fixture
            .tool("ExtractAndWriteUserInfo")
            .invoke(json!({"text": "Bob Smith, 30, bob@example.com"}))
            .await
            .expect("write");
        assert_eq!(output, ToolOutput::text("Member Bob Smith already exists with ID: 2"));
    }

    #[tokio::test]
    async fn extract_and_write_inserts_new_member() {
        let fixture = fixture();
        fixture.provider.push_structured(
            "UserInfo",
            json!({"name": "Tedy Tsao", "email": "dkk94729@gmail.com", "age": 22}),
        );

        let output = fixture
            .tool("ExtractAndWriteUserInfo")
            .invoke(json!({"text": "A new member, Tedy Tsao, 22, dkk94729@gmail.com"}))
            .await
            .expect("write");
        assert_eq!(
            output,
            ToolOutput::text(
                "Extracted and wrote user info: (ID: 4, name: Tedy Tsao, email: dkk94729@gmail.com, age: 22)"
            )
        );
    }

    #[tokio::test]
    async fn record_fetcher_lists_purchases() {
        let fixture = fixture();
        fixture.provider.push_structured("UserInfo", json!({"name": "Bob Smith"}));

        let output = fixture
            .tool("PurchaseRecordFetcher")
            .invoke(json!({"text": "My name is Bob Smith, show me my purchase records"}))
            .await
            .expect("fetch");
        assert_eq!(
            output.render(),
            "Purchase records for Bob Smith (ID: 2):\n- Record ID: 2, Product: Smartphone, Price: 499.99, Number: 2, Payment: 999.98\n"
        );

        fixture.provider.push_structured("UserInfo", json!({"name": "Andy Tsao"}));
        let output = fixture
            .tool("PurchaseRecordFetcher")
            .invoke(json!({"text": "My name is Andy Tsao"}))
            .await
            .expect("fetch");
        assert_eq!(output, ToolOutput::text("No member found for name 'Andy Tsao'"));
    }

    #[tokio::test]
    async fn view_all_members_returns_table() {
        let fixture = fixture();
        let output = fixture
            .tool("ViewAllMembers")
            .invoke(json!({}))
            .await
            .expect("view");

        let ToolOutput::Table(table) = output else {
            panic!("expected table");
        };
        assert_eq!(table.columns, ["id", "name", "email", "age"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0][1], json!("Alice Johnson"));
    }
}
