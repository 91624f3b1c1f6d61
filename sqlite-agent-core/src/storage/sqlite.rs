use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::OnceCell;

use crate::config::schema::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::model::{Member, MemberPurchase, Product, RecordView};
use crate::storage::DataStore;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS member (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, email TEXT, age INTEGER)",
    "CREATE TABLE IF NOT EXISTS product (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL, price REAL NOT NULL)",
    "CREATE TABLE IF NOT EXISTS record (id INTEGER PRIMARY KEY AUTOINCREMENT, member_id INTEGER, product_id INTEGER, number INTEGER, FOREIGN KEY (member_id) REFERENCES member(id), FOREIGN KEY (product_id) REFERENCES product(id))",
];

const SEED_MEMBERS: [(&str, &str, i64); 3] = [
    ("Alice Johnson", "alice@example.com", 25),
    ("Bob Smith", "bob@example.com", 30),
    ("Charlie Brown", "charlie@example.com", 22),
];

const SEED_PRODUCTS: [(&str, f64); 3] = [
    ("Laptop", 999.99),
    ("Smartphone", 499.99),
    ("Headphones", 199.99),
];

const SEED_RECORDS: [(i64, i64, i64); 3] = [(1, 1, 1), (2, 2, 2), (3, 3, 3)];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: sqlx::SqlitePool,
    seed_example_data: bool,
    initialized: Arc<OnceCell<()>>,
}

impl SqliteStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let in_memory = config.database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|err| {
                Error::Storage(format!(
                    "invalid database url '{}': {err}",
                    config.database_url
                ))
            })?
            .create_if_missing(true)
            .foreign_keys(config.sqlite.foreign_keys)
            .busy_timeout(Duration::from_millis(config.sqlite.busy_timeout_ms));

        if !in_memory {
            let journal_mode =
                SqliteJournalMode::from_str(&config.sqlite.journal_mode).map_err(|err| {
                    Error::Config(format!(
                        "invalid sqlite journal_mode '{}': {err}",
                        config.sqlite.journal_mode
                    ))
                })?;
            options = options.journal_mode(journal_mode);
        }

        // Every connection to `:memory:` opens a separate database, so the
        // pool is pinned to one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.pool_size.max(1) as u32)
        };

        Ok(Self {
            pool: pool_options.connect_lazy_with(options),
            seed_example_data: config.seed_example_data,
            initialized: Arc::new(OnceCell::new()),
        })
    }

    /// Private in-memory database, seeded with the example rows.
    pub fn in_memory() -> Result<Self> {
        Self::new(&StorageConfig {
            database_url: "sqlite::memory:".to_owned(),
            pool_size: 1,
            ..StorageConfig::default()
        })
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                if self.seed_example_data {
                    self.seed_if_empty().await?;
                }
                Ok::<(), Error>(())
            })
            .await
            .map(|_| ())
    }

    async fn seed_if_empty(&self) -> Result<()> {
        let members: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM member")
            .fetch_one(&self.pool)
            .await?;
        if members > 0 {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for (name, email, age) in SEED_MEMBERS {
            sqlx::query("INSERT INTO member (name, email, age) VALUES (?, ?, ?)")
                .bind(name)
                .bind(email)
                .bind(age)
                .execute(&mut *tx)
                .await?;
        }
        for (name, price) in SEED_PRODUCTS {
            sqlx::query("INSERT INTO product (name, price) VALUES (?, ?)")
                .bind(name)
                .bind(price)
                .execute(&mut *tx)
                .await?;
        }
        for (member_id, product_id, number) in SEED_RECORDS {
            sqlx::query("INSERT INTO record (member_id, product_id, number) VALUES (?, ?, ?)")
                .bind(member_id)
                .bind(product_id)
                .bind(number)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!("seeded empty database with example members, products and records");
        Ok(())
    }

    fn member_from_row(row: &SqliteRow) -> Result<Member> {
        Ok(Member {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            age: row.try_get("age")?,
        })
    }

    fn product_from_row(row: &SqliteRow) -> Result<Product> {
        Ok(Product {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            price: row.try_get("price")?,
        })
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn insert_member(
        &self,
        name: &str,
        email: Option<&str>,
        age: Option<i64>,
    ) -> Result<i64> {
        self.ensure_initialized().await?;

        let result = sqlx::query("INSERT INTO member (name, email, age) VALUES (?, ?, ?)")
            .bind(name)
            .bind(email)
            .bind(age)
            .execute(&self.pool)
            .await?;
        tracing::debug!(member = name, id = result.last_insert_rowid(), "inserted member");
        Ok(result.last_insert_rowid())
    }

    async fn insert_product(&self, name: &str, price: f64) -> Result<i64> {
        self.ensure_initialized().await?;

        let result = sqlx::query("INSERT INTO product (name, price) VALUES (?, ?)")
            .bind(name)
            .bind(price)
            .execute(&self.pool)
            .await?;
        tracing::debug!(product = name, id = result.last_insert_rowid(), "inserted product");
        Ok(result.last_insert_rowid())
    }

    async fn insert_record(&self, member_id: i64, product_id: i64, quantity: i64) -> Result<i64> {
        self.ensure_initialized().await?;

        let result =
            sqlx::query("INSERT INTO record (member_id, product_id, number) VALUES (?, ?, ?)")
                .bind(member_id)
                .bind(product_id)
                .bind(quantity)
                .execute(&self.pool)
                .await?;
        tracing::debug!(
            member_id,
            product_id,
            quantity,
            id = result.last_insert_rowid(),
            "inserted purchase record"
        );
        Ok(result.last_insert_rowid())
    }

    async fn get_member_by_name(&self, name: &str) -> Result<Option<Member>> {
        self.ensure_initialized().await?;

        let row = sqlx::query("SELECT id, name, email, age FROM member WHERE name = ? ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::member_from_row).transpose()
    }

    async fn get_product_by_name(&self, name: &str) -> Result<Option<Product>> {
        self.ensure_initialized().await?;

        let row = sqlx::query("SELECT id, name, price FROM product WHERE name = ? ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::product_from_row).transpose()
    }

    async fn get_member_records(&self, member_id: i64) -> Result<Vec<MemberPurchase>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(
            "SELECT record.id AS record_id, product.name AS product_name, product.price AS price, record.number AS quantity, product.price * record.number AS payment FROM record JOIN product ON record.product_id = product.id WHERE record.member_id = ? ORDER BY record.id",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(MemberPurchase {
                    record_id: row.try_get("record_id")?,
                    product_name: row.try_get("product_name")?,
                    price: row.try_get("price")?,
                    quantity: row.try_get("quantity")?,
                    payment: row.try_get("payment")?,
                })
            })
            .collect()
    }

    async fn list_all_members(&self) -> Result<Vec<Member>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query("SELECT id, name, email, age FROM member ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::member_from_row).collect()
    }

    async fn list_all_products(&self) -> Result<Vec<Product>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query("SELECT id, name, price FROM product ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::product_from_row).collect()
    }

    async fn list_all_records(&self) -> Result<Vec<RecordView>> {
        self.ensure_initialized().await?;

        let rows = sqlx::query(
            "SELECT record.id AS id, member.name AS member_name, product.name AS product_name, record.number AS quantity FROM record JOIN member ON record.member_id = member.id JOIN product ON record.product_id = product.id ORDER BY record.id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RecordView {
                    id: row.try_get("id")?,
                    member_name: row.try_get("member_name")?,
                    product_name: row.try_get("product_name")?,
                    quantity: row.try_get("quantity")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeds_three_rows_per_table() {
        let store = SqliteStore::in_memory().expect("store");

        assert_eq!(store.list_all_members().await.expect("members").len(), 3);
        assert_eq!(store.list_all_products().await.expect("products").len(), 3);

        let records = store.list_all_records().await.expect("records");
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].member_name, "Bob Smith");
        assert_eq!(records[1].product_name, "Smartphone");
        assert_eq!(records[1].quantity, 2);
    }

    #[tokio::test]
    async fn seeding_can_be_disabled() {
        let store = SqliteStore::new(&StorageConfig {
            database_url: "sqlite::memory:".to_owned(),
            seed_example_data: false,
            ..StorageConfig::default()
        })
        .expect("store");

        assert!(store.list_all_members().await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn inserted_member_is_found_by_name() {
        let store = SqliteStore::in_memory().expect("store");

        let id = store
            .insert_member("Tedy Tsao", Some("tedy@example.com"), Some(22))
            .await
            .expect("insert");
        let member = store
            .get_member_by_name("Tedy Tsao")
            .await
            .expect("lookup")
            .expect("member exists");

        assert_eq!(member.id, id);
        assert_eq!(member.email.as_deref(), Some("tedy@example.com"));
        assert!(store
            .get_member_by_name("Nobody")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn member_records_include_payment() {
        let store = SqliteStore::in_memory().expect("store");
        store.insert_record(3, 1, 2).await.expect("insert record");

        let records = store.get_member_records(3).await.expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].product_name, "Headphones");
        assert_eq!(records[0].quantity, 3);
        assert!((records[1].payment - 1999.98).abs() < 1e-6);
    }

    #[tokio::test]
    async fn member_without_email_or_age_is_stored() {
        let store = SqliteStore::in_memory().expect("store");
        store
            .insert_member("Dana", None, None)
            .await
            .expect("insert");

        let member = store
            .get_member_by_name("Dana")
            .await
            .expect("lookup")
            .expect("member exists");
        assert_eq!(member.email, None);
        assert_eq!(member.age, None);
    }
}
