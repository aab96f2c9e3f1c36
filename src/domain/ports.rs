//! Collaborator contracts consumed by the cart core.
//!
//! Storage, catalog, member and shop lookups are injected as trait objects
//! through [`CartServices`]; nothing in the cart core reaches for a global.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::domain::aggregates::CartItem;
use crate::domain::value_objects::{CartKind, CartOwner, DeliverAddress, Shop, SkuSnapshot};
use crate::Result;

/// Persisted cart row.
#[derive(Clone, Debug, PartialEq)]
pub struct CartRecord {
    pub id: i64,
    pub kind: CartKind,
    pub code: String,
    pub buyer_id: Option<i64>,
    pub shop_id: Option<i64>,
    pub payment_opt: i32,
    pub deliver_opt: i32,
    pub deliver_id: Option<i64>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Line query / bulk delete filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineFilter {
    Cart(i64),
    Line { cart_id: i64, item_id: i64, sku_id: i64 },
}

/// Merge source to delete in the same commit, at the row version it was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discard {
    pub cart_id: i64,
    pub version: i32,
}

/// Everything one `commit` writes. Applied atomically: upserted lines are
/// re-keyed onto `cart`, `deletes` are line ids, and `discard` names another
/// cart of the same kind to delete with all its remaining lines.
#[derive(Clone, Debug)]
pub struct CartChangeSet {
    pub cart: CartRecord,
    pub upserts: Vec<CartItem>,
    pub deletes: Vec<i64>,
    pub discard: Option<Discard>,
}

/// Result of a commit: the cart id, its new row version and `(id, version)`
/// for each upserted line, in the order they were submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub cart_id: i64,
    pub version: i32,
    pub lines: Vec<(i64, i32)>,
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get_cart(&self, kind: CartKind, id: i64) -> Result<Option<CartRecord>>;

    /// Latest cart for the owner. Anonymous owners match on `code`, members on
    /// `buyer_id`.
    async fn find_cart(&self, kind: CartKind, owner: &CartOwner) -> Result<Option<CartRecord>>;

    async fn select_lines(&self, kind: CartKind, filter: LineFilter) -> Result<Vec<CartItem>>;

    async fn delete_lines(&self, kind: CartKind, filter: LineFilter) -> Result<u64>;

    /// The cart row, existing lines and the discarded cart are written only if
    /// their stored versions still equal the submitted ones; otherwise nothing
    /// is written and [`CartError::Conflict`](crate::CartError::Conflict) is
    /// returned. Every successful commit bumps the cart row version.
    async fn commit(&self, kind: CartKind, changes: CartChangeSet) -> Result<Committed>;

    async fn delete_cart(&self, kind: CartKind, id: i64) -> Result<()>;
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// `None` when the SKU does not exist or belongs to another item.
    async fn get_sku(&self, item_id: i64, sku_id: i64) -> Result<Option<SkuSnapshot>>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// `None` when the address does not exist or is not the buyer's.
    async fn get_address(&self, buyer_id: i64, address_id: i64) -> Result<Option<DeliverAddress>>;
}

#[async_trait]
pub trait ShopDirectory: Send + Sync {
    async fn get_shop(&self, shop_id: i64) -> Result<Option<Shop>>;
}

/// Handles every cart aggregate carries.
#[derive(Clone)]
pub struct CartServices {
    pub store: Arc<dyn CartStore>,
    pub catalog: Arc<dyn Catalog>,
    pub members: Arc<dyn MemberDirectory>,
    pub shops: Arc<dyn ShopDirectory>,
}

impl fmt::Debug for CartServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("CartServices") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_object_safe() {
        fn _store(_: &dyn CartStore) {}
        fn _catalog(_: &dyn Catalog) {}
        fn _members(_: &dyn MemberDirectory) {}
        fn _shops(_: &dyn ShopDirectory) {}
    }
}
