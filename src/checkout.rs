//! Checkout projections.
//!
//! Lines are grouped by shop (retail) or seller (wholesale) in first-seen
//! order and enriched with live catalog data on every build, so prices and
//! availability always reflect the catalog at render time.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::aggregates::{Cart, CartItem};
use crate::domain::ports::Catalog;
use crate::domain::value_objects::{CartKind, CheckedMap, SkuSnapshot};
use crate::Result;

const IN_STOCK: &str = "In stock";
const OUT_OF_STOCK: &str = "Out of stock";

#[derive(Clone, Debug, Serialize)]
pub struct ShoppingCartView {
    pub cart_id: i64,
    pub code: String,
    pub shops: Vec<ShopGroup>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ShopGroup {
    pub vendor_id: i64,
    pub shop_id: i64,
    pub checked: bool,
    pub items: Vec<CartItemView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CartItemView {
    pub item_id: i64,
    pub sku_id: i64,
    pub shop_id: i64,
    pub quantity: i32,
    pub checked: bool,
    pub title: String,
    pub image: String,
    pub price: Decimal,
    pub retail_price: Decimal,
    pub spec_word: String,
    pub code: String,
    pub stock_text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct WholesaleCartView {
    pub cart_id: i64,
    pub code: String,
    pub sellers: Vec<SellerGroup>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SellerGroup {
    pub seller_id: i64,
    pub checked: bool,
    pub items: Vec<WholesaleItemView>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WholesaleItemView {
    pub item_id: i64,
    pub item_name: String,
    pub item_image: String,
    pub skus: Vec<SkuRow>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SkuRow {
    pub sku_id: i64,
    pub sku_code: String,
    pub sku_image: String,
    pub spec_word: String,
    pub quantity: i32,
    pub checked: bool,
    pub price: Decimal,
    pub discount_price: Decimal,
    pub can_sales_quantity: i32,
}

#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum CartView {
    Retail(ShoppingCartView),
    Wholesale(WholesaleCartView),
}

/// Compact payload for cart badges and mini-cart widgets.
#[derive(Clone, Debug, Serialize)]
pub struct QuickCartView {
    pub count: usize,
    pub quantity: i64,
    pub items: Vec<QuickItem>,
}

#[derive(Clone, Debug, Serialize)]
pub struct QuickItem {
    pub item_id: i64,
    pub sku_id: i64,
    pub title: String,
    pub image: String,
    pub spec_word: String,
    pub quantity: i32,
    pub price: Decimal,
}

/// Builds grouped views of a cart against the live catalog.
#[derive(Clone)]
pub struct CheckoutBuilder {
    catalog: Arc<dyn Catalog>,
    image_base: String,
}

impl std::fmt::Debug for CheckoutBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutBuilder").field("image_base", &self.image_base).finish()
    }
}

/// Groups in first-seen order.
fn group_by<'a, K, T>(items: impl IntoIterator<Item = &'a CartItem>, key: impl Fn(&CartItem) -> K, mut new: impl FnMut(&CartItem) -> T) -> Vec<(T, Vec<&'a CartItem>)>
where
    K: std::hash::Hash + Eq,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(T, Vec<&'a CartItem>)> = Vec::new();
    for item in items {
        let at = *index.entry(key(item)).or_insert_with(|| {
            groups.push((new(item), Vec::new()));
            groups.len() - 1
        });
        groups[at].1.push(item);
    }
    groups
}

impl CheckoutBuilder {
    pub fn new(catalog: Arc<dyn Catalog>, image_base: impl Into<String>) -> Self {
        Self { catalog, image_base: image_base.into() }
    }

    /// Prefixes relative catalog image paths with the image server base.
    pub fn image_url(&self, path: &str) -> String {
        let absolute = path.starts_with("http://") || path.starts_with("https://") || path.starts_with("//");
        if path.is_empty() || absolute || self.image_base.is_empty() {
            return path.to_string();
        }
        format!("{}/{}", self.image_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    async fn snapshot(&self, item: &CartItem) -> Result<Option<SkuSnapshot>> {
        self.catalog.get_sku(item.item_id, item.sku_id).await
    }

    pub async fn view(&self, cart: &Cart) -> Result<CartView> {
        Ok(match cart.kind() {
            CartKind::Retail => CartView::Retail(self.retail_view(cart).await?),
            CartKind::Wholesale => CartView::Wholesale(self.wholesale_view(cart, false, None).await?),
        })
    }

    pub async fn retail_view(&self, cart: &Cart) -> Result<ShoppingCartView> {
        cart.ensure_kind(CartKind::Retail)?;
        let mut shops = Vec::new();
        for (mut group, lines) in group_by(cart.items(), |i| i.shop_id, |i| ShopGroup {
            vendor_id: i.vendor_id, shop_id: i.shop_id, checked: false, items: vec![],
        }) {
            for line in lines {
                group.checked |= line.checked;
                group.items.push(self.item_view(line).await?);
            }
            shops.push(group);
        }
        Ok(ShoppingCartView { cart_id: cart.id(), code: cart.code().to_string(), shops })
    }

    async fn item_view(&self, line: &CartItem) -> Result<CartItemView> {
        let mut view = CartItemView {
            item_id: line.item_id, sku_id: line.sku_id, shop_id: line.shop_id,
            quantity: line.quantity, checked: line.checked,
            title: String::new(), image: String::new(), price: Decimal::ZERO, retail_price: Decimal::ZERO,
            spec_word: String::new(), code: String::new(), stock_text: OUT_OF_STOCK.to_string(),
        };
        if let Some(sku) = self.snapshot(line).await? {
            view.image = self.image_url(&sku.image);
            view.stock_text = if sku.in_stock() { IN_STOCK } else { OUT_OF_STOCK }.to_string();
            view.price = sku.price;
            view.retail_price = sku.retail_price;
            view.title = sku.title;
            view.spec_word = sku.spec_word;
            view.code = sku.code;
        }
        Ok(view)
    }

    /// Seller → item → SKU rows. With `checkout` set only the lines in
    /// `checked` are projected.
    pub async fn wholesale_view(&self, cart: &Cart, checkout: bool, checked: Option<&CheckedMap>) -> Result<WholesaleCartView> {
        cart.ensure_kind(CartKind::Wholesale)?;
        let lines: Vec<&CartItem> = match (checkout, checked) {
            (true, Some(checked)) => cart.checked_items(checked),
            (true, None) => cart.items().iter().filter(|i| i.checked).collect(),
            (false, _) => cart.items().iter().collect(),
        };
        let mut sellers = Vec::new();
        for (seller_id, seller_lines) in group_by(lines, |i| i.vendor_id, |i| i.vendor_id) {
            let mut seller = SellerGroup { seller_id, checked: false, items: vec![] };
            for (item_id, item_lines) in group_by(seller_lines, |i| i.item_id, |i| i.item_id) {
                let mut item = WholesaleItemView { item_id, item_name: String::new(), item_image: String::new(), skus: vec![] };
                for line in item_lines {
                    seller.checked |= line.checked;
                    let sku = self.snapshot(line).await?;
                    if let (true, Some(sku)) = (item.item_name.is_empty(), &sku) {
                        item.item_name = sku.title.clone();
                        item.item_image = self.image_url(&sku.image);
                    }
                    item.skus.push(self.sku_row(line, sku));
                }
                seller.items.push(item);
            }
            sellers.push(seller);
        }
        Ok(WholesaleCartView { cart_id: cart.id(), code: cart.code().to_string(), sellers })
    }

    fn sku_row(&self, line: &CartItem, sku: Option<SkuSnapshot>) -> SkuRow {
        let mut row = SkuRow {
            sku_id: line.sku_id, sku_code: String::new(), sku_image: String::new(), spec_word: String::new(),
            quantity: line.quantity, checked: line.checked,
            price: Decimal::ZERO, discount_price: Decimal::ZERO, can_sales_quantity: 0,
        };
        if let Some(sku) = sku {
            row.sku_image = self.image_url(&sku.image);
            row.price = sku.retail_price;
            row.discount_price = sku.price;
            row.can_sales_quantity = sku.stock.max(0);
            row.sku_code = sku.code;
            row.spec_word = sku.spec_word;
        }
        row
    }

    /// At most `max` lines of a wholesale cart, serialized compactly.
    pub async fn quick_view(&self, cart: &Cart, max: usize) -> Result<String> {
        cart.ensure_kind(CartKind::Wholesale)?;
        let mut items = Vec::with_capacity(max.min(cart.item_count()));
        for line in cart.items().iter().take(max) {
            let sku = self.snapshot(line).await?;
            items.push(QuickItem {
                item_id: line.item_id,
                sku_id: line.sku_id,
                title: sku.as_ref().map(|s| s.title.clone()).unwrap_or_default(),
                image: sku.as_ref().map(|s| self.image_url(&s.image)).unwrap_or_default(),
                spec_word: sku.as_ref().map(|s| s.spec_word.clone()).unwrap_or_default(),
                quantity: line.quantity,
                price: sku.as_ref().map(|s| s.price).unwrap_or_default(),
            });
        }
        let quick = QuickCartView {
            count: cart.item_count(),
            quantity: cart.items().iter().map(|i| i64::from(i.quantity)).sum(),
            items,
        };
        Ok(serde_json::to_string(&quick)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::{CartOwner, ItemPair};
    use crate::repository::memory::fixtures;
    use crate::repository::CartRepository;
    use crate::CartError;

    fn check(item_id: i64, sku_id: i64) -> ItemPair { ItemPair { item_id, sku_id, quantity: 0, checked: true } }

    #[tokio::test]
    async fn test_retail_groups_by_shop() {
        let catalog = fixtures::catalog().await;
        let repo = CartRepository::from_services(fixtures::services_with(catalog.clone()).await);
        let builder = CheckoutBuilder::new(catalog, "https://img.example.com/");
        let mut cart = repo.new_cart(CartKind::Retail, CartOwner::Member(7));
        cart.put(1, 10, 1).await.unwrap();
        cart.put(3, 30, 2).await.unwrap();
        cart.put(2, 0, 1).await.unwrap();
        cart.sign_item_checked(&[check(3, 30)]);

        let view = builder.retail_view(&cart).await.unwrap();
        assert_eq!(view.shops.len(), 2);
        assert_eq!(view.shops[0].shop_id, 100);
        assert!(!view.shops[0].checked);
        assert_eq!(view.shops[0].items.len(), 2);
        assert_eq!(view.shops[1].shop_id, 200);
        assert!(view.shops[1].checked);

        let line = &view.shops[0].items[0];
        assert_eq!(line.image, "https://img.example.com/img/1-10.jpg");
        assert_eq!(line.price, Decimal::new(1000, 2));
        assert_eq!(line.stock_text, IN_STOCK);
        assert_eq!(view.shops[1].items[0].stock_text, OUT_OF_STOCK);
    }

    #[tokio::test]
    async fn test_price_is_read_at_render_time() {
        let catalog = fixtures::catalog().await;
        let repo = CartRepository::from_services(fixtures::services_with(catalog.clone()).await);
        let builder = CheckoutBuilder::new(catalog.clone(), "");
        let mut cart = repo.new_cart(CartKind::Retail, CartOwner::Member(7));
        cart.put(1, 10, 1).await.unwrap();
        catalog.insert(fixtures::sku(1, 10, 100, 1000, 799, 5)).await;
        let view = builder.retail_view(&cart).await.unwrap();
        assert_eq!(view.shops[0].items[0].price, Decimal::new(799, 2));
        assert_eq!(view.shops[0].items[0].image, "img/1-10.jpg");
    }

    #[tokio::test]
    async fn test_wholesale_groups_by_seller_and_item() {
        let catalog = fixtures::catalog().await;
        let repo = CartRepository::from_services(fixtures::services_with(catalog.clone()).await);
        let builder = CheckoutBuilder::new(catalog, "");
        let mut cart = repo.new_cart(CartKind::Wholesale, CartOwner::Member(7));
        cart.put(1, 10, 10).await.unwrap();
        cart.put(3, 30, 5).await.unwrap();
        cart.put(1, 11, 20).await.unwrap();
        cart.sign_item_checked(&[check(1, 11)]);

        let view = builder.wholesale_view(&cart, false, None).await.unwrap();
        assert_eq!(view.sellers.len(), 2);
        let first = &view.sellers[0];
        assert_eq!(first.seller_id, 1000);
        assert!(first.checked);
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].item_name, "Item 1");
        assert_eq!(first.items[0].skus.len(), 2);
        assert_eq!(first.items[0].skus[1].discount_price, Decimal::new(1200, 2));
        assert!(!view.sellers[1].checked);
        assert_eq!(view.sellers[1].items[0].skus[0].can_sales_quantity, 0);

        let only = builder.wholesale_view(&cart, true, Some(&CheckedMap::from([(3, vec![30])]))).await.unwrap();
        assert_eq!(only.sellers.len(), 1);
        assert_eq!(only.sellers[0].seller_id, 2000);
    }

    #[tokio::test]
    async fn test_quick_view_caps_lines() {
        let catalog = fixtures::catalog().await;
        let repo = CartRepository::from_services(fixtures::services_with(catalog.clone()).await);
        let builder = CheckoutBuilder::new(catalog, "");
        let mut cart = repo.new_cart(CartKind::Wholesale, CartOwner::Member(7));
        cart.put(1, 10, 1).await.unwrap();
        cart.put(1, 11, 2).await.unwrap();
        cart.put(2, 0, 3).await.unwrap();

        let json: serde_json::Value = serde_json::from_str(&builder.quick_view(&cart, 2).await.unwrap()).unwrap();
        assert_eq!(json["count"], 3);
        assert_eq!(json["quantity"], 6);
        assert_eq!(json["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_projection_kind_mismatch() {
        let catalog = fixtures::catalog().await;
        let repo = CartRepository::from_services(fixtures::services_with(catalog.clone()).await);
        let builder = CheckoutBuilder::new(catalog, "");
        let retail = repo.new_cart(CartKind::Retail, CartOwner::Member(7));
        assert!(matches!(builder.quick_view(&retail, 5).await, Err(CartError::KindMismatch { .. })));
        assert!(matches!(builder.wholesale_view(&retail, false, None).await, Err(CartError::KindMismatch { .. })));
    }
}
