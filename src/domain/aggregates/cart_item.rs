//! Cart line

use serde::{Deserialize, Serialize};
use crate::domain::value_objects::SkuSnapshot;

/// One (item, sku) line of a cart. `sku_id` 0 means the item has no variant.
///
/// `vendor_id` is the seller for wholesale carts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CartItem {
    pub id: i64,
    pub cart_id: i64,
    pub vendor_id: i64,
    pub shop_id: i64,
    pub item_id: i64,
    pub sku_id: i64,
    pub quantity: i32,
    pub checked: bool,
    pub version: i32,
    #[sqlx(skip)]
    #[serde(skip)]
    pub sku: Option<SkuSnapshot>,
    #[sqlx(skip)]
    #[serde(skip)]
    pub(crate) dirty: bool,
}

impl CartItem {
    pub(crate) fn from_snapshot(sku: SkuSnapshot, quantity: i32) -> Self {
        Self {
            id: 0, cart_id: 0, vendor_id: sku.vendor_id, shop_id: sku.shop_id,
            item_id: sku.item_id, sku_id: sku.sku_id, quantity, checked: false,
            version: 0, sku: Some(sku), dirty: true,
        }
    }

    pub fn matches(&self, item_id: i64, sku_id: i64) -> bool {
        self.item_id == item_id && self.sku_id == sku_id
    }

    pub fn is_new(&self) -> bool { self.id == 0 }

    pub(crate) fn set_quantity(&mut self, quantity: i32) {
        self.quantity = quantity;
        self.dirty = true;
    }

    pub(crate) fn set_checked(&mut self, checked: bool) {
        if self.checked != checked {
            self.checked = checked;
            self.dirty = true;
        }
    }
}
