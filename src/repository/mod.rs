//! Cart resolution and the anonymous-to-buyer merge.

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::aggregates::Cart;
use crate::domain::ports::{CartRecord, CartServices, CartStore, Catalog, LineFilter, MemberDirectory, ShopDirectory};
use crate::domain::value_objects::{CartKind, CartOwner};
use crate::{CartError, Result};

pub const MERGE_ATTEMPTS: usize = 3;

/// Resolves carts for owners. Aggregates handed out are request-scoped: load
/// one, mutate it, save it, drop it.
#[derive(Clone, Debug)]
pub struct CartRepository {
    services: CartServices,
}

impl CartRepository {
    pub fn new(
        store: Arc<dyn CartStore>,
        catalog: Arc<dyn Catalog>,
        members: Arc<dyn MemberDirectory>,
        shops: Arc<dyn ShopDirectory>,
    ) -> Self {
        Self::from_services(CartServices { store, catalog, members, shops })
    }

    pub fn from_services(services: CartServices) -> Self { Self { services } }

    pub fn services(&self) -> &CartServices { &self.services }

    /// Unsaved cart for `owner`; it gets an id on first save.
    pub fn new_cart(&self, kind: CartKind, owner: CartOwner) -> Cart {
        Cart::create(kind, owner, self.services.clone())
    }

    pub fn new_retail_cart(&self, code: &str) -> Cart {
        self.new_cart(CartKind::Retail, CartOwner::Anonymous(code.to_string()))
    }

    /// Unsaved anonymous cart under a freshly generated key.
    pub fn new_anonymous_cart(&self, kind: CartKind) -> Cart {
        self.new_cart(kind, CartOwner::Anonymous(Uuid::new_v4().simple().to_string()))
    }

    async fn load(&self, record: CartRecord) -> Result<Cart> {
        let items = self.services.store.select_lines(record.kind, LineFilter::Cart(record.id)).await?;
        Ok(Cart::load(record, items, self.services.clone()))
    }

    #[instrument(skip(self))]
    pub async fn get_cart(&self, kind: CartKind, id: i64) -> Result<Cart> {
        let record = self.services.store.get_cart(kind, id).await?.ok_or(CartError::CartNotFound)?;
        self.load(record).await
    }

    pub async fn get_retail_cart(&self, id: i64) -> Result<Cart> { self.get_cart(CartKind::Retail, id).await }

    /// Persisted cart for the owner, if any. Anonymous keys only match carts
    /// that have not been bound to a buyer.
    #[instrument(skip(self))]
    pub async fn find_cart(&self, kind: CartKind, owner: &CartOwner) -> Result<Option<Cart>> {
        match self.services.store.find_cart(kind, owner).await? {
            Some(record) => Ok(Some(self.load(record).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_latest_cart(&self, buyer_id: i64) -> Result<Option<Cart>> {
        self.find_cart(CartKind::Retail, &CartOwner::Member(buyer_id)).await
    }

    /// The buyer's cart of `kind`, created and saved empty if there is none.
    #[instrument(skip(self))]
    pub async fn get_my_cart(&self, buyer_id: i64, kind: CartKind) -> Result<Cart> {
        let owner = CartOwner::Member(buyer_id);
        if let Some(cart) = self.find_cart(kind, &owner).await? {
            return Ok(cart);
        }
        let mut cart = self.new_cart(kind, owner.clone());
        match cart.save().await {
            Ok(_) => Ok(cart),
            // another request created it first
            Err(CartError::Conflict(_)) => {
                warn!(buyer_id, %kind, "buyer cart created concurrently");
                self.find_cart(kind, &owner).await?.ok_or(CartError::CartNotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Anonymous retail cart for `key`; a new unsaved one when none exists.
    pub async fn get_shopping_cart_by_key(&self, key: &str) -> Result<Cart> {
        self.resolve(&CartOwner::Anonymous(key.to_string()), CartKind::Retail).await
    }

    pub async fn resolve(&self, owner: &CartOwner, kind: CartKind) -> Result<Cart> {
        match owner {
            CartOwner::Member(buyer_id) => self.get_my_cart(*buyer_id, kind).await,
            CartOwner::Anonymous(_) => match self.find_cart(kind, owner).await? {
                Some(cart) => Ok(cart),
                None => Ok(self.new_cart(kind, owner.clone())),
            },
        }
    }

    /// Login-time reconciliation: folds the anonymous cart under `key` into the
    /// buyer's cart and deletes it, all in one commit. Once the anonymous cart
    /// is gone, repeating the call returns the buyer cart unchanged.
    ///
    /// A commit that loses a race with another write to either cart leaves
    /// both untouched; the merge is then redone from fresh reads, up to
    /// [`MERGE_ATTEMPTS`] times.
    #[instrument(skip(self))]
    pub async fn merge_on_login(&self, key: &str, buyer_id: i64, kind: CartKind) -> Result<Cart> {
        let mut attempt = 1;
        loop {
            match self.try_merge(key, buyer_id, kind).await {
                Err(CartError::Conflict(cart_id)) if attempt < MERGE_ATTEMPTS => {
                    warn!(cart_id, attempt, "cart changed during merge, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_merge(&self, key: &str, buyer_id: i64, kind: CartKind) -> Result<Cart> {
        let anonymous = self.find_cart(kind, &CartOwner::Anonymous(key.to_string())).await?;
        let mut buyer = self.get_my_cart(buyer_id, kind).await?;
        let Some(anonymous) = anonymous else { return Ok(buyer) };
        let from_cart_id = anonymous.id();
        let lines = buyer.combine(anonymous)?;
        buyer.save().await?;
        info!(from_cart_id, into_cart_id = buyer.id(), buyer_id, lines, "merged anonymous cart");
        Ok(buyer)
    }

    /// Bulk-deletes every line of the cart, keeping the cart row.
    pub async fn empty_cart(&self, kind: CartKind, id: i64) -> Result<u64> {
        self.services.store.delete_lines(kind, LineFilter::Cart(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::CartItem;
    use crate::domain::ports::{CartChangeSet, Committed};
    use crate::domain::value_objects::ItemPair;
    use crate::repository::memory::{fixtures, MemoryCartStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store where some other request writes to the merge source right before
    /// every merge commit lands.
    #[derive(Default)]
    struct ContendedStore {
        inner: MemoryCartStore,
        merges: AtomicUsize,
    }

    #[async_trait]
    impl CartStore for ContendedStore {
        async fn get_cart(&self, kind: CartKind, id: i64) -> Result<Option<CartRecord>> { self.inner.get_cart(kind, id).await }
        async fn find_cart(&self, kind: CartKind, owner: &CartOwner) -> Result<Option<CartRecord>> { self.inner.find_cart(kind, owner).await }
        async fn select_lines(&self, kind: CartKind, filter: LineFilter) -> Result<Vec<CartItem>> { self.inner.select_lines(kind, filter).await }
        async fn delete_lines(&self, kind: CartKind, filter: LineFilter) -> Result<u64> { self.inner.delete_lines(kind, filter).await }
        async fn delete_cart(&self, kind: CartKind, id: i64) -> Result<()> { self.inner.delete_cart(kind, id).await }

        async fn commit(&self, kind: CartKind, changes: CartChangeSet) -> Result<Committed> {
            if let Some(discard) = changes.discard {
                self.merges.fetch_add(1, Ordering::SeqCst);
                if let Some(source) = self.inner.get_cart(kind, discard.cart_id).await? {
                    let touch = CartChangeSet { cart: source, upserts: vec![], deletes: vec![], discard: None };
                    self.inner.commit(kind, touch).await?;
                }
            }
            self.inner.commit(kind, changes).await
        }
    }

    async fn repository() -> CartRepository { CartRepository::from_services(fixtures::services().await) }

    async fn anonymous_with(repo: &CartRepository, key: &str, lines: &[(i64, i64, u32)]) -> Cart {
        let mut cart = repo.get_shopping_cart_by_key(key).await.unwrap();
        for &(item_id, sku_id, quantity) in lines {
            cart.put(item_id, sku_id, quantity).await.unwrap();
        }
        cart.save().await.unwrap();
        cart
    }

    fn pairs(cart: &Cart) -> Vec<(i64, i64, i32)> {
        let mut pairs: Vec<_> = cart.items().iter().map(|i| (i.item_id, i.sku_id, i.quantity)).collect();
        pairs.sort();
        pairs
    }

    #[tokio::test]
    async fn test_get_my_cart_creates_once() {
        let repo = repository().await;
        let first = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert!(first.id() > 0);
        assert_eq!(first.buyer_id(), Some(7));
        let again = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert_eq!(first.id(), again.id());
        let wholesale = repo.get_my_cart(7, CartKind::Wholesale).await.unwrap();
        assert_eq!(wholesale.kind(), CartKind::Wholesale);
        assert!(matches!(repo.get_cart(CartKind::Retail, 999).await, Err(CartError::CartNotFound)));
    }

    #[tokio::test]
    async fn test_unknown_key_is_new_cart() {
        let repo = repository().await;
        let cart = repo.get_shopping_cart_by_key("nope").await.unwrap();
        assert_eq!(cart.id(), 0);
        assert_eq!(cart.code(), "nope");
        assert!(cart.is_empty());
    }

    #[tokio::test]
    async fn test_merge_into_empty_buyer_cart() {
        let repo = repository().await;
        let anonymous = anonymous_with(&repo, "k1", &[(1, 10, 2), (2, 0, 1)]).await;
        let expected = pairs(&anonymous);

        let buyer = repo.merge_on_login("k1", 7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&buyer), expected);
        assert!(repo.find_cart(CartKind::Retail, &CartOwner::Anonymous("k1".into())).await.unwrap().is_none());
        assert!(matches!(repo.get_retail_cart(anonymous.id()).await, Err(CartError::CartNotFound)));

        let reloaded = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&reloaded), expected);
    }

    #[tokio::test]
    async fn test_merge_adds_quantities() {
        let repo = repository().await;
        let mut buyer = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        buyer.put(1, 10, 2).await.unwrap();
        buyer.put(3, 30, 1).await.unwrap();
        buyer.save().await.unwrap();
        anonymous_with(&repo, "k2", &[(1, 10, 3), (2, 0, 4)]).await;

        let merged = repo.merge_on_login("k2", 7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&merged), vec![(1, 10, 5), (2, 0, 4), (3, 30, 1)]);

        // retry of the same login changes nothing
        let again = repo.merge_on_login("k2", 7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&again), vec![(1, 10, 5), (2, 0, 4), (3, 30, 1)]);
        let reloaded = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&reloaded), vec![(1, 10, 5), (2, 0, 4), (3, 30, 1)]);
    }

    #[tokio::test]
    async fn test_merge_keeps_lines_added_after_read() {
        let repo = repository().await;
        anonymous_with(&repo, "k5", &[(1, 10, 1)]).await;
        let stale = repo.get_shopping_cart_by_key("k5").await.unwrap();
        let mut other_tab = repo.get_shopping_cart_by_key("k5").await.unwrap();
        other_tab.put(2, 0, 4).await.unwrap();
        other_tab.save().await.unwrap();

        let mut buyer = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        buyer.combine(stale).unwrap();
        assert!(matches!(buyer.save().await, Err(CartError::Conflict(_))));
        let anonymous = repo.get_shopping_cart_by_key("k5").await.unwrap();
        assert_eq!(pairs(&anonymous), vec![(1, 10, 1), (2, 0, 4)]);
        assert!(repo.get_my_cart(7, CartKind::Retail).await.unwrap().is_empty());

        let merged = repo.merge_on_login("k5", 7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&merged), vec![(1, 10, 1), (2, 0, 4)]);
        assert!(repo.find_cart(CartKind::Retail, &CartOwner::Anonymous("k5".into())).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_merge_leaves_both_carts() {
        let store = Arc::new(ContendedStore::default());
        let services = CartServices { store: store.clone(), ..fixtures::services().await };
        let repo = CartRepository::from_services(services);
        let mut buyer = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        buyer.put(1, 10, 2).await.unwrap();
        buyer.save().await.unwrap();
        anonymous_with(&repo, "k6", &[(1, 10, 3), (2, 0, 1)]).await;

        let result = repo.merge_on_login("k6", 7, CartKind::Retail).await;
        assert!(matches!(result, Err(CartError::Conflict(_))));
        assert_eq!(store.merges.load(Ordering::SeqCst), MERGE_ATTEMPTS);

        let anonymous = repo.get_shopping_cart_by_key("k6").await.unwrap();
        assert_eq!(pairs(&anonymous), vec![(1, 10, 3), (2, 0, 1)]);
        let buyer = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&buyer), vec![(1, 10, 2)]);
    }

    #[tokio::test]
    async fn test_stale_save_keeps_settlement() {
        let repo = repository().await;
        let mut cart = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        cart.put(1, 10, 1).await.unwrap();
        cart.sign_item_checked(&[ItemPair { item_id: 1, sku_id: 10, quantity: 0, checked: true }]);
        cart.save().await.unwrap();

        let mut first_tab = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        let mut second_tab = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        first_tab.settle_persist(100, 1, 2, 70).await.unwrap();
        second_tab.put(2, 0, 1).await.unwrap();
        assert!(matches!(second_tab.save().await, Err(CartError::Conflict(_))));

        let reloaded = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        assert_eq!(reloaded.settlement().shop_id, Some(100));
        assert_eq!(pairs(&reloaded), vec![(1, 10, 1)]);

        // a stale settle fails and leaves the aggregate as loaded
        let mut stale = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        first_tab.set_buyer_address(70).await.unwrap();
        let before = stale.settlement().clone();
        assert!(matches!(stale.settle_persist(200, 3, 3, 0).await, Err(CartError::Conflict(_))));
        assert_eq!(stale.settlement(), &before);
        assert!(matches!(stale.set_buyer_address(70).await, Err(CartError::Conflict(_))));
        assert_eq!(stale.settlement(), &before);
    }

    #[tokio::test]
    async fn test_merge_empty_anonymous_is_noop() {
        let repo = repository().await;
        let mut buyer = repo.get_my_cart(8, CartKind::Retail).await.unwrap();
        buyer.put(2, 0, 1).await.unwrap();
        buyer.save().await.unwrap();
        anonymous_with(&repo, "empty", &[]).await;
        let merged = repo.merge_on_login("empty", 8, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&merged), vec![(2, 0, 1)]);
        let merged = repo.merge_on_login("never-seen", 8, CartKind::Retail).await.unwrap();
        assert_eq!(pairs(&merged), vec![(2, 0, 1)]);
    }

    #[tokio::test]
    async fn test_merge_keeps_checked_selection() {
        let repo = repository().await;
        let mut anonymous = anonymous_with(&repo, "k3", &[(1, 11, 1)]).await;
        anonymous.sign_item_checked(&[ItemPair { item_id: 1, sku_id: 11, quantity: 0, checked: true }]);
        anonymous.save().await.unwrap();
        let merged = repo.merge_on_login("k3", 7, CartKind::Retail).await.unwrap();
        assert!(merged.get_item(1, 11).unwrap().checked);
        merged.check().unwrap();
    }

    #[tokio::test]
    async fn test_release_whole_cart() {
        let repo = repository().await;
        let mut cart = repo.get_my_cart(7, CartKind::Retail).await.unwrap();
        cart.put(1, 10, 1).await.unwrap();
        cart.save().await.unwrap();
        assert!(cart.release(&crate::CheckedMap::from([(1, vec![10])])));
        cart.save().await.unwrap();
        assert!(repo.get_my_cart(7, CartKind::Retail).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_and_empty() {
        let repo = repository().await;
        let mut cart = anonymous_with(&repo, "k4", &[(1, 10, 1), (2, 0, 1)]).await;
        assert_eq!(repo.empty_cart(CartKind::Retail, cart.id()).await.unwrap(), 2);
        assert!(repo.get_retail_cart(cart.id()).await.unwrap().is_empty());
        cart.destroy().await.unwrap();
        assert!(matches!(repo.get_retail_cart(cart.id()).await, Err(CartError::CartNotFound)));
    }
}
