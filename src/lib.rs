//! OpenSASE Cart
//!
//! Shopping cart service for the OpenSASE e-commerce platform.
//!
//! ## Features
//! - Retail (single shop) and wholesale (multi-seller) carts
//! - Anonymous carts merged into the buyer's cart at login
//! - Checkout selection, settlement hand-off and release after ordering
//! - Shop / seller grouped checkout projections priced from the live catalog

pub mod api;
pub mod checkout;
pub mod config;
pub mod domain;
pub mod repository;

pub use checkout::{CartView, CheckoutBuilder};
pub use config::Config;
pub use domain::aggregates::{Cart, CartItem, SettleData};
pub use domain::events::CartEvent;
pub use domain::ports::CartServices;
pub use domain::value_objects::{parse_checked_map, CartKind, CartOwner, CheckedMap, ItemPair};
pub use repository::CartRepository;

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CartError {
    #[error("Cart has no items")]
    EmptyCart,

    #[error("No items checked for checkout")]
    NoChecked,

    #[error("Cart kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: CartKind, actual: CartKind },

    #[error("Cart not found")]
    CartNotFound,

    #[error("SKU {sku_id} does not belong to item {item_id}")]
    InvalidSku { item_id: i64, sku_id: i64 },

    #[error("Address {0} does not belong to the buyer")]
    AddressNotOwned(i64),

    #[error("Item {item_id}/{sku_id} is not in the cart")]
    ItemNotFound { item_id: i64, sku_id: i64 },

    #[error("Cart is not bound to a buyer")]
    NoBuyer,

    #[error("Invalid quantity")]
    InvalidQuantity,

    #[error("Cart {0} was modified concurrently")]
    Conflict(i64),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CartError {
    /// Stable code for presentation-layer messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyCart => "empty_shopping_cart",
            Self::NoChecked => "empty_shopping_cart_no_checked",
            Self::KindMismatch { .. } => "err_cart_kind_not_match",
            Self::CartNotFound => "empty_shopping_no_such_cart",
            Self::InvalidSku { .. } => "err_cart_item_no_sku",
            Self::AddressNotOwned(_) => "err_cart_address_not_owned",
            Self::ItemNotFound { .. } => "err_cart_item_not_found",
            Self::NoBuyer => "err_cart_no_buyer",
            Self::InvalidQuantity => "err_cart_invalid_quantity",
            Self::Conflict(_) => "err_cart_conflict",
            Self::Storage(_) => "err_storage",
            Self::Serialization(_) => "err_serialization",
        }
    }

    /// True for errors the buyer can act on, as opposed to infrastructure
    /// failures.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Conflict(_) | Self::Storage(_) | Self::Serialization(_))
    }
}

pub type Result<T> = std::result::Result<T, CartError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CartError::NoChecked.code(), "empty_shopping_cart_no_checked");
        assert!(CartError::EmptyCart.is_validation());
        assert!(!CartError::Conflict(3).is_validation());
        let e = CartError::KindMismatch { expected: CartKind::Retail, actual: CartKind::Wholesale };
        assert_eq!(e.to_string(), "Cart kind mismatch: expected retail, got wholesale");
    }
}
