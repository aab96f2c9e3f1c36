//! In-memory store and collaborators.
//!
//! Each cart kind has its own table set behind one async mutex; a commit runs
//! against a copy of the tables and is swapped in only when every write
//! succeeded, so a failed commit leaves nothing behind.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};

use crate::domain::aggregates::CartItem;
use crate::domain::ports::{
    CartChangeSet, CartRecord, CartStore, Catalog, Committed, LineFilter, MemberDirectory, ShopDirectory,
};
use crate::domain::value_objects::{CartKind, CartOwner, DeliverAddress, Shop, SkuSnapshot};
use crate::{CartError, Result};

#[derive(Clone, Debug, Default)]
struct Tables {
    carts: BTreeMap<i64, CartRecord>,
    items: BTreeMap<i64, CartItem>,
    next_cart_id: i64,
    next_item_id: i64,
}

impl LineFilter {
    fn accepts(&self, item: &CartItem) -> bool {
        match *self {
            Self::Cart(cart_id) => item.cart_id == cart_id,
            Self::Line { cart_id, item_id, sku_id } => item.cart_id == cart_id && item.matches(item_id, sku_id),
        }
    }
}

impl Tables {
    fn apply(&mut self, changes: CartChangeSet) -> Result<Committed> {
        let mut cart = changes.cart;
        if cart.id == 0 {
            if let Some(buyer_id) = cart.buyer_id {
                if self.carts.values().any(|c| c.buyer_id == Some(buyer_id)) {
                    return Err(CartError::Conflict(0));
                }
            }
            self.next_cart_id += 1;
            cart.id = self.next_cart_id;
            cart.version = 0;
        } else {
            let stored = self.carts.get(&cart.id).ok_or(CartError::CartNotFound)?;
            if stored.version != cart.version { return Err(CartError::Conflict(cart.id)); }
            cart.version += 1;
        }
        let (cart_id, version) = (cart.id, cart.version);
        self.carts.insert(cart_id, cart);

        for id in &changes.deletes {
            self.items.remove(id);
        }

        let mut lines = Vec::with_capacity(changes.upserts.len());
        for mut item in changes.upserts {
            item.cart_id = cart_id;
            if item.is_new() {
                self.next_item_id += 1;
                item.id = self.next_item_id;
                item.version = 0;
            } else {
                let stored = self.items.get(&item.id).ok_or(CartError::Conflict(cart_id))?;
                if stored.version != item.version { return Err(CartError::Conflict(cart_id)); }
                item.version += 1;
            }
            let duplicate = self.items.values()
                .any(|o| o.id != item.id && o.cart_id == cart_id && o.matches(item.item_id, item.sku_id));
            if duplicate { return Err(CartError::Conflict(cart_id)); }
            item.sku = None;
            item.dirty = false;
            lines.push((item.id, item.version));
            self.items.insert(item.id, item);
        }

        if let Some(discard) = changes.discard.filter(|d| d.cart_id != cart_id) {
            let current = self.carts.get(&discard.cart_id).is_some_and(|c| c.version == discard.version);
            if !current { return Err(CartError::Conflict(discard.cart_id)); }
            self.carts.remove(&discard.cart_id);
            self.items.retain(|_, i| i.cart_id != discard.cart_id);
        }
        Ok(Committed { cart_id, version, lines })
    }
}

#[derive(Debug, Default)]
pub struct MemoryCartStore {
    retail: Mutex<Tables>,
    wholesale: Mutex<Tables>,
}

impl MemoryCartStore {
    pub fn new() -> Self { Self::default() }

    fn tables(&self, kind: CartKind) -> &Mutex<Tables> {
        match kind { CartKind::Retail => &self.retail, CartKind::Wholesale => &self.wholesale }
    }
}

#[async_trait]
impl CartStore for MemoryCartStore {
    async fn get_cart(&self, kind: CartKind, id: i64) -> Result<Option<CartRecord>> {
        Ok(self.tables(kind).lock().await.carts.get(&id).cloned())
    }

    async fn find_cart(&self, kind: CartKind, owner: &CartOwner) -> Result<Option<CartRecord>> {
        let tables = self.tables(kind).lock().await;
        Ok(tables.carts.values()
            .filter(|c| match owner {
                CartOwner::Anonymous(code) => c.buyer_id.is_none() && &c.code == code,
                CartOwner::Member(buyer_id) => c.buyer_id == Some(*buyer_id),
            })
            .max_by_key(|c| (c.updated_at, c.id))
            .cloned())
    }

    async fn select_lines(&self, kind: CartKind, filter: LineFilter) -> Result<Vec<CartItem>> {
        let tables = self.tables(kind).lock().await;
        Ok(tables.items.values().filter(|i| filter.accepts(i)).cloned().collect())
    }

    async fn delete_lines(&self, kind: CartKind, filter: LineFilter) -> Result<u64> {
        let mut tables = self.tables(kind).lock().await;
        let before = tables.items.len();
        tables.items.retain(|_, i| !filter.accepts(i));
        Ok((before - tables.items.len()) as u64)
    }

    async fn commit(&self, kind: CartKind, changes: CartChangeSet) -> Result<Committed> {
        let mut tables = self.tables(kind).lock().await;
        let mut next = tables.clone();
        let committed = next.apply(changes)?;
        *tables = next;
        Ok(committed)
    }

    async fn delete_cart(&self, kind: CartKind, id: i64) -> Result<()> {
        let mut tables = self.tables(kind).lock().await;
        tables.carts.remove(&id);
        tables.items.retain(|_, i| i.cart_id != id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    skus: RwLock<HashMap<(i64, i64), SkuSnapshot>>,
}

impl MemoryCatalog {
    pub fn new() -> Self { Self::default() }

    /// Adds or replaces a SKU snapshot.
    pub async fn insert(&self, sku: SkuSnapshot) {
        self.skus.write().await.insert((sku.item_id, sku.sku_id), sku);
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_sku(&self, item_id: i64, sku_id: i64) -> Result<Option<SkuSnapshot>> {
        Ok(self.skus.read().await.get(&(item_id, sku_id)).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    addresses: RwLock<HashMap<i64, DeliverAddress>>,
    shops: RwLock<HashMap<i64, Shop>>,
}

impl MemoryDirectory {
    pub fn new() -> Self { Self::default() }

    pub async fn insert_address(&self, address: DeliverAddress) {
        self.addresses.write().await.insert(address.id, address);
    }

    pub async fn insert_shop(&self, shop: Shop) {
        self.shops.write().await.insert(shop.id, shop);
    }
}

#[async_trait]
impl MemberDirectory for MemoryDirectory {
    async fn get_address(&self, buyer_id: i64, address_id: i64) -> Result<Option<DeliverAddress>> {
        Ok(self.addresses.read().await.get(&address_id).filter(|a| a.buyer_id == buyer_id).cloned())
    }
}

#[async_trait]
impl ShopDirectory for MemoryDirectory {
    async fn get_shop(&self, shop_id: i64) -> Result<Option<Shop>> {
        Ok(self.shops.read().await.get(&shop_id).cloned())
    }
}
