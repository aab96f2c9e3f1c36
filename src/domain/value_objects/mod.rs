//! Value objects for the cart domain

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Cart kind. Retail carts check out against a single shop, wholesale carts
/// are grouped by seller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartKind {
    #[default]
    Retail,
    Wholesale,
}

impl CartKind {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Retail => "retail", Self::Wholesale => "wholesale" }
    }

    pub(crate) fn cart_table(&self) -> &'static str {
        match self { Self::Retail => "retail_cart", Self::Wholesale => "wholesale_cart" }
    }

    pub(crate) fn item_table(&self) -> &'static str {
        match self { Self::Retail => "retail_cart_item", Self::Wholesale => "wholesale_cart_item" }
    }
}

impl fmt::Display for CartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Who a cart belongs to. Exactly one key is authoritative: the anonymous
/// code until a buyer is bound, the buyer id afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartOwner {
    Anonymous(String),
    Member(i64),
}

impl CartOwner {
    pub fn buyer_id(&self) -> Option<i64> {
        match self { Self::Member(id) => Some(*id), Self::Anonymous(_) => None }
    }

    pub fn code(&self) -> Option<&str> {
        match self { Self::Anonymous(code) => Some(code), Self::Member(_) => None }
    }

    pub fn is_member(&self) -> bool { matches!(self, Self::Member(_)) }
}

impl fmt::Display for CartOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous(code) => write!(f, "anonymous:{}", code),
            Self::Member(id) => write!(f, "member:{}", id),
        }
    }
}

/// A selection sent back from the checkout screen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPair {
    pub item_id: i64,
    pub sku_id: i64,
    #[serde(default)]
    pub quantity: u32,
    pub checked: bool,
}

/// Item id to the SKU ids selected under it.
pub type CheckedMap = HashMap<i64, Vec<i64>>;

/// Parses a checked map posted as `{"1":["10","11"],"2":["20"]}`.
///
/// Numeric SKU entries are accepted as well. Returns `None` for an empty
/// object or anything that does not parse.
pub fn parse_checked_map(data: &str) -> Option<CheckedMap> {
    let data = data.trim();
    if data.is_empty() || data == "{}" { return None; }
    let src: HashMap<String, Vec<serde_json::Value>> = serde_json::from_str(data).ok()?;
    let mut checked = CheckedMap::with_capacity(src.len());
    for (key, skus) in src {
        let item_id = key.trim().parse::<i64>().ok()?;
        let sku_ids = skus.iter().map(|v| match v {
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }).collect::<Option<Vec<_>>>()?;
        checked.insert(item_id, sku_ids);
    }
    Some(checked)
}

/// Live catalog data for one (item, sku) pair. Attached to cart lines at read
/// time only, never stored with them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SkuSnapshot {
    pub item_id: i64,
    pub sku_id: i64,
    pub shop_id: i64,
    pub vendor_id: i64,
    pub title: String,
    pub image: String,
    pub price: Decimal,
    pub retail_price: Decimal,
    pub stock: i32,
    pub spec_word: String,
    pub code: String,
}

impl SkuSnapshot {
    pub fn in_stock(&self) -> bool { self.stock > 0 }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shop {
    pub id: i64,
    pub vendor_id: i64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliverAddress {
    pub id: i64,
    pub buyer_id: i64,
    pub consignee: String,
    pub phone: String,
    pub area: String,
    pub address: String,
}

/// Checkout parameters recorded by `Cart::settle_persist`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub shop_id: Option<i64>,
    pub payment_opt: i32,
    pub deliver_opt: i32,
    pub address_id: Option<i64>,
}

impl Settlement {
    pub fn is_settled(&self) -> bool { self.shop_id.is_some() }
}
