use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub age: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
}

/// One purchase of a member, joined with the product it refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberPurchase {
    pub record_id: i64,
    pub product_name: String,
    pub price: f64,
    pub quantity: i64,
    pub payment: f64,
}

/// Purchase record joined with member and product names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub id: i64,
    pub member_name: String,
    pub product_name: String,
    pub quantity: i64,
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(ID: {}, name: {}, email: {}, age: {})",
            self.id,
            self.name,
            self.email.as_deref().unwrap_or("-"),
            self.age
                .map(|age| age.to_string())
                .unwrap_or_else(|| "-".to_owned())
        )
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(ID: {}, name: {}, price: {})", self.id, self.name, self.price)
    }
}
