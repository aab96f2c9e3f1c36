//! Cart Aggregate

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::events::CartEvent;
use crate::domain::ports::{CartChangeSet, CartRecord, CartServices, Discard};
use crate::domain::value_objects::{
    CartKind, CartOwner, CheckedMap, DeliverAddress, ItemPair, Settlement, Shop,
};
use crate::{CartError, Result};

pub use super::cart_item::CartItem;

/// Read-only view of what `settle_persist` recorded, resolved for the
/// confirmation screen. `shop` is `None` when the cart was never settled.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SettleData {
    pub shop: Option<Shop>,
    pub address: Option<DeliverAddress>,
    pub payment_opt: i32,
    pub deliver_opt: i32,
}

#[derive(Clone, Debug)]
pub struct Cart {
    id: i64,
    kind: CartKind,
    code: String,
    owner: CartOwner,
    settlement: Settlement,
    items: Vec<CartItem>,
    removed: Vec<i64>,
    discard: Option<Discard>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<CartEvent>,
    services: CartServices,
}

fn to_quantity(quantity: u32) -> i32 { i32::try_from(quantity).unwrap_or(i32::MAX) }

impl Cart {
    /// New, unsaved cart. Anonymous carts keep the owner code; member carts get
    /// a fresh code which only survives as an alias.
    pub(crate) fn create(kind: CartKind, owner: CartOwner, services: CartServices) -> Self {
        let code = owner.code().map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let now = Utc::now();
        Self {
            id: 0, kind, code, owner, settlement: Settlement::default(),
            items: vec![], removed: vec![], discard: None, version: 0,
            created_at: now, updated_at: now, events: vec![], services,
        }
    }

    pub(crate) fn load(record: CartRecord, items: Vec<CartItem>, services: CartServices) -> Self {
        let owner = match record.buyer_id {
            Some(buyer_id) => CartOwner::Member(buyer_id),
            None => CartOwner::Anonymous(record.code.clone()),
        };
        Self {
            id: record.id, kind: record.kind, code: record.code, owner,
            settlement: Settlement {
                shop_id: record.shop_id, payment_opt: record.payment_opt,
                deliver_opt: record.deliver_opt, address_id: record.deliver_id,
            },
            items, removed: vec![], discard: None, version: record.version,
            created_at: record.created_at, updated_at: record.updated_at,
            events: vec![], services,
        }
    }

    pub fn id(&self) -> i64 { self.id }
    pub fn kind(&self) -> CartKind { self.kind }
    pub fn code(&self) -> &str { &self.code }
    pub fn owner(&self) -> &CartOwner { &self.owner }
    pub fn buyer_id(&self) -> Option<i64> { self.owner.buyer_id() }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn settlement(&self) -> &Settlement { &self.settlement }
    pub fn item_count(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn get_item(&self, item_id: i64, sku_id: i64) -> Option<&CartItem> {
        self.items.iter().find(|i| i.matches(item_id, sku_id))
    }

    pub fn ensure_kind(&self, expected: CartKind) -> Result<()> {
        if self.kind != expected {
            return Err(CartError::KindMismatch { expected, actual: self.kind });
        }
        Ok(())
    }

    /// Adds `quantity` of (item, sku). An existing line is incremented; a new
    /// line takes its shop and vendor from the catalog and starts unchecked.
    pub async fn put(&mut self, item_id: i64, sku_id: i64, quantity: u32) -> Result<()> {
        if quantity == 0 { return Err(CartError::InvalidQuantity); }
        let delta = to_quantity(quantity);
        match self.position(item_id, sku_id) {
            Some(idx) => {
                let item = &mut self.items[idx];
                item.set_quantity(item.quantity.saturating_add(delta));
            }
            None => {
                let sku = self.services.catalog.get_sku(item_id, sku_id).await?
                    .filter(|s| s.item_id == item_id && s.sku_id == sku_id)
                    .ok_or(CartError::InvalidSku { item_id, sku_id })?;
                self.items.push(CartItem::from_snapshot(sku, delta));
            }
        }
        debug!(cart_id = self.id, item_id, sku_id, quantity, "put cart item");
        self.raise_event(CartEvent::ItemPut { cart_id: self.id, item_id, sku_id, quantity });
        self.touch();
        Ok(())
    }

    /// Sets the line quantity absolutely; 0 removes the line.
    pub fn update(&mut self, item_id: i64, sku_id: i64, quantity: u32) -> Result<()> {
        let idx = self.position(item_id, sku_id).ok_or(CartError::ItemNotFound { item_id, sku_id })?;
        if quantity == 0 { self.remove_at(idx); }
        else { self.items[idx].set_quantity(to_quantity(quantity)); }
        self.touch();
        Ok(())
    }

    /// Takes `quantity` off the line, dropping it once nothing is left. Absent
    /// lines are ignored.
    pub fn remove(&mut self, item_id: i64, sku_id: i64, quantity: u32) {
        let Some(idx) = self.position(item_id, sku_id) else { return };
        let left = self.items[idx].quantity.saturating_sub(to_quantity(quantity));
        if left <= 0 { self.remove_at(idx); }
        else { self.items[idx].set_quantity(left); }
        self.touch();
    }

    pub fn sign_item_checked(&mut self, pairs: &[ItemPair]) {
        for pair in pairs {
            if let Some(idx) = self.position(pair.item_id, pair.sku_id) {
                self.items[idx].set_checked(pair.checked);
            }
        }
        self.touch();
    }

    /// Gate before settlement: the cart needs lines and at least one checked.
    pub fn check(&self) -> Result<()> {
        if self.items.is_empty() { return Err(CartError::EmptyCart); }
        if !self.items.iter().any(|i| i.checked) { return Err(CartError::NoChecked); }
        Ok(())
    }

    /// Lines listed in `checked`, in cart order.
    pub fn checked_items(&self, checked: &CheckedMap) -> Vec<&CartItem> {
        self.items.iter()
            .filter(|i| checked.get(&i.item_id).is_some_and(|skus| skus.contains(&i.sku_id)))
            .collect()
    }

    /// Drops the pairs that became order lines. Returns true when nothing is
    /// left in the cart. Pairs already gone are skipped.
    pub fn release(&mut self, checked: &CheckedMap) -> bool {
        let mut released = 0;
        for (&item_id, skus) in checked {
            for &sku_id in skus {
                if let Some(idx) = self.position(item_id, sku_id) {
                    self.remove_at(idx);
                    released += 1;
                }
            }
        }
        if released > 0 { self.touch(); }
        let consumed = self.items.is_empty();
        info!(cart_id = self.id, released, consumed, "released cart items");
        self.raise_event(CartEvent::Released { cart_id: self.id, lines: released, consumed });
        consumed
    }

    pub async fn settle_persist(&mut self, shop_id: i64, payment_opt: i32, deliver_opt: i32, address_id: i64) -> Result<()> {
        self.check()?;
        let settlement = Settlement {
            shop_id: Some(shop_id), payment_opt, deliver_opt,
            address_id: (address_id > 0).then_some(address_id).or(self.settlement.address_id),
        };
        self.save_settlement(settlement).await?;
        self.raise_event(CartEvent::Settled { cart_id: self.id, shop_id });
        Ok(())
    }

    pub async fn get_settle_data(&self) -> Result<SettleData> {
        let shop = match self.settlement.shop_id {
            Some(shop_id) => self.services.shops.get_shop(shop_id).await?,
            None => None,
        };
        let address = match (self.buyer_id(), self.settlement.address_id) {
            (Some(buyer_id), Some(address_id)) => self.services.members.get_address(buyer_id, address_id).await?,
            _ => None,
        };
        Ok(SettleData { shop, address, payment_opt: self.settlement.payment_opt, deliver_opt: self.settlement.deliver_opt })
    }

    pub async fn set_buyer_address(&mut self, address_id: i64) -> Result<()> {
        let buyer_id = self.buyer_id().ok_or(CartError::NoBuyer)?;
        self.services.members.get_address(buyer_id, address_id).await?
            .ok_or(CartError::AddressNotOwned(address_id))?;
        let settlement = Settlement { address_id: Some(address_id), ..self.settlement.clone() };
        self.save_settlement(settlement).await
    }

    /// Saves with `settlement` in place; a failed save puts the old one back.
    async fn save_settlement(&mut self, settlement: Settlement) -> Result<()> {
        let previous = std::mem::replace(&mut self.settlement, settlement);
        let updated_at = self.updated_at;
        self.touch();
        if let Err(e) = self.save().await {
            self.settlement = previous;
            self.updated_at = updated_at;
            return Err(e);
        }
        Ok(())
    }

    /// Folds `other` into this cart: matching pairs add quantities, the rest
    /// are moved over keeping their row ids. The source cart is deleted by the
    /// next `save`, in the same commit.
    pub fn combine(&mut self, other: Cart) -> Result<usize> {
        if other.kind != self.kind {
            return Err(CartError::KindMismatch { expected: self.kind, actual: other.kind });
        }
        if other.id != 0 && other.id == self.id { return Ok(0); }
        let (from_cart_id, from_version) = (other.id, other.version);
        let lines = other.items.len();
        for mut line in other.items {
            match self.position(line.item_id, line.sku_id) {
                Some(idx) => {
                    let item = &mut self.items[idx];
                    item.set_quantity(item.quantity.saturating_add(line.quantity));
                    if line.checked { item.set_checked(true); }
                }
                None => {
                    line.cart_id = self.id;
                    line.dirty = true;
                    self.items.push(line);
                }
            }
        }
        if from_cart_id != 0 { self.discard = Some(Discard { cart_id: from_cart_id, version: from_version }); }
        self.raise_event(CartEvent::Merged { from_cart_id, into_cart_id: self.id, lines });
        self.touch();
        Ok(lines)
    }

    /// Writes the cart row, new and changed lines, deletions and a pending
    /// merge source in one store commit. Returns the cart id.
    pub async fn save(&mut self) -> Result<i64> {
        let dirty: Vec<usize> = self.items.iter().enumerate()
            .filter(|(_, i)| i.dirty || i.is_new())
            .map(|(idx, _)| idx)
            .collect();
        let changes = CartChangeSet {
            cart: self.to_record(),
            upserts: dirty.iter().map(|&idx| self.items[idx].clone()).collect(),
            deletes: self.removed.clone(),
            discard: self.discard,
        };
        let committed = self.services.store.commit(self.kind, changes).await?;
        let created = self.id == 0;
        self.id = committed.cart_id;
        self.version = committed.version;
        for (&idx, (id, version)) in dirty.iter().zip(committed.lines) {
            let item = &mut self.items[idx];
            item.id = id;
            item.version = version;
            item.cart_id = self.id;
            item.dirty = false;
        }
        self.removed.clear();
        self.discard = None;
        if created {
            info!(cart_id = self.id, kind = %self.kind, owner = %self.owner, "created cart");
            self.raise_event(CartEvent::Created { cart_id: self.id, kind: self.kind, owner: self.owner.clone() });
        }
        Ok(self.id)
    }

    pub async fn destroy(&mut self) -> Result<()> {
        if self.id != 0 {
            self.services.store.delete_cart(self.kind, self.id).await?;
        }
        info!(cart_id = self.id, kind = %self.kind, "destroyed cart");
        self.items.clear();
        self.removed.clear();
        self.raise_event(CartEvent::Destroyed { cart_id: self.id });
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<CartEvent> { std::mem::take(&mut self.events) }

    fn to_record(&self) -> CartRecord {
        CartRecord {
            id: self.id, kind: self.kind, code: self.code.clone(), buyer_id: self.buyer_id(),
            shop_id: self.settlement.shop_id, payment_opt: self.settlement.payment_opt,
            deliver_opt: self.settlement.deliver_opt, deliver_id: self.settlement.address_id,
            version: self.version, created_at: self.created_at, updated_at: self.updated_at,
        }
    }

    fn position(&self, item_id: i64, sku_id: i64) -> Option<usize> {
        self.items.iter().position(|i| i.matches(item_id, sku_id))
    }

    fn remove_at(&mut self, idx: usize) {
        let item = self.items.remove(idx);
        if !item.is_new() { self.removed.push(item.id); }
    }

    fn raise_event(&mut self, e: CartEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
