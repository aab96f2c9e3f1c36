//! Domain events
use crate::domain::value_objects::{CartKind, CartOwner};
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartEvent {
    Created { cart_id: i64, kind: CartKind, owner: CartOwner },
    ItemPut { cart_id: i64, item_id: i64, sku_id: i64, quantity: u32 },
    Merged { from_cart_id: i64, into_cart_id: i64, lines: usize },
    Released { cart_id: i64, lines: usize, consumed: bool },
    Settled { cart_id: i64, shop_id: i64 },
    Destroyed { cart_id: i64 },
}
