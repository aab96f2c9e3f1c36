//! Aggregates module
pub mod cart;
pub mod cart_item;

pub use cart::{Cart, SettleData};
pub use cart_item::CartItem;
