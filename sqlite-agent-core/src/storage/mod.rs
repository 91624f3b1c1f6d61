pub mod model;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::storage::model::{Member, MemberPurchase, Product, RecordView};

pub use sqlite::SqliteStore;

/// Persistence surface shared by the built-in tools and tool scripts.
/// Every write commits before the call returns.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn insert_member(&self, name: &str, email: Option<&str>, age: Option<i64>)
        -> Result<i64>;
    async fn insert_product(&self, name: &str, price: f64) -> Result<i64>;
    async fn insert_record(&self, member_id: i64, product_id: i64, quantity: i64) -> Result<i64>;

    async fn get_member_by_name(&self, name: &str) -> Result<Option<Member>>;
    async fn get_product_by_name(&self, name: &str) -> Result<Option<Product>>;
    async fn get_member_records(&self, member_id: i64) -> Result<Vec<MemberPurchase>>;

    async fn list_all_members(&self) -> Result<Vec<Member>>;
    async fn list_all_products(&self) -> Result<Vec<Product>>;
    async fn list_all_records(&self) -> Result<Vec<RecordView>>;
}
