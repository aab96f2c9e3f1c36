//! Postgres-backed store and collaborator lookups.
//!
//! Retail and wholesale carts live in separate tables with the same shape.
//! Every `commit` runs in one transaction; dropping the transaction on an
//! early return rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{instrument, warn};

use crate::domain::aggregates::CartItem;
use crate::domain::ports::{
    CartChangeSet, CartRecord, CartStore, Catalog, Committed, LineFilter, MemberDirectory, ShopDirectory,
};
use crate::domain::value_objects::{CartKind, CartOwner, DeliverAddress, Shop, SkuSnapshot};
use crate::{CartError, Result};

const CART_COLUMNS: &str = "id, code, buyer_id, shop_id, payment_opt, deliver_opt, deliver_id, version, created_at, updated_at";
const ITEM_COLUMNS: &str = "id, cart_id, vendor_id, shop_id, item_id, sku_id, quantity, checked, version";

#[derive(Debug, sqlx::FromRow)]
struct CartRow {
    id: i64,
    code: String,
    buyer_id: Option<i64>,
    shop_id: Option<i64>,
    payment_opt: i32,
    deliver_opt: i32,
    deliver_id: Option<i64>,
    version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CartRow {
    fn into_record(self, kind: CartKind) -> CartRecord {
        CartRecord {
            id: self.id, kind, code: self.code, buyer_id: self.buyer_id, shop_id: self.shop_id,
            payment_opt: self.payment_opt, deliver_opt: self.deliver_opt, deliver_id: self.deliver_id,
            version: self.version,
            created_at: self.created_at, updated_at: self.updated_at,
        }
    }
}

/// Unique violations mean another request won the race for the same row.
fn conflict_or_storage(cart_id: i64) -> impl FnOnce(sqlx::Error) -> CartError {
    move |e| {
        let unique = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
        if unique {
            warn!(cart_id, "unique constraint violated while saving cart");
            CartError::Conflict(cart_id)
        } else {
            CartError::Storage(e)
        }
    }
}

fn line_where(filter: LineFilter) -> (&'static str, Vec<i64>) {
    match filter {
        LineFilter::Cart(cart_id) => ("cart_id = $1", vec![cart_id]),
        LineFilter::Line { cart_id, item_id, sku_id } => {
            ("cart_id = $1 AND item_id = $2 AND sku_id = $3", vec![cart_id, item_id, sku_id])
        }
    }
}

#[derive(Clone, Debug)]
pub struct PgCartStore {
    db: PgPool,
}

impl PgCartStore {
    pub fn new(db: PgPool) -> Self { Self { db } }
}

#[async_trait]
impl CartStore for PgCartStore {
    async fn get_cart(&self, kind: CartKind, id: i64) -> Result<Option<CartRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", CART_COLUMNS, kind.cart_table());
        let row = sqlx::query_as::<_, CartRow>(&sql).bind(id).fetch_optional(&self.db).await?;
        Ok(row.map(|r| r.into_record(kind)))
    }

    async fn find_cart(&self, kind: CartKind, owner: &CartOwner) -> Result<Option<CartRecord>> {
        let row = match owner {
            CartOwner::Anonymous(code) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE code = $1 AND buyer_id IS NULL ORDER BY updated_at DESC, id DESC LIMIT 1",
                    CART_COLUMNS, kind.cart_table());
                sqlx::query_as::<_, CartRow>(&sql).bind(code).fetch_optional(&self.db).await?
            }
            CartOwner::Member(buyer_id) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE buyer_id = $1 ORDER BY updated_at DESC, id DESC LIMIT 1",
                    CART_COLUMNS, kind.cart_table());
                sqlx::query_as::<_, CartRow>(&sql).bind(buyer_id).fetch_optional(&self.db).await?
            }
        };
        Ok(row.map(|r| r.into_record(kind)))
    }

    async fn select_lines(&self, kind: CartKind, filter: LineFilter) -> Result<Vec<CartItem>> {
        let (clause, args) = line_where(filter);
        let sql = format!("SELECT {} FROM {} WHERE {} ORDER BY id", ITEM_COLUMNS, kind.item_table(), clause);
        let mut query = sqlx::query_as::<_, CartItem>(&sql);
        for arg in args { query = query.bind(arg); }
        Ok(query.fetch_all(&self.db).await?)
    }

    async fn delete_lines(&self, kind: CartKind, filter: LineFilter) -> Result<u64> {
        let (clause, args) = line_where(filter);
        let sql = format!("DELETE FROM {} WHERE {}", kind.item_table(), clause);
        let mut query = sqlx::query(&sql);
        for arg in args { query = query.bind(arg); }
        Ok(query.execute(&self.db).await?.rows_affected())
    }

    #[instrument(skip(self, changes), fields(cart_id = changes.cart.id))]
    async fn commit(&self, kind: CartKind, changes: CartChangeSet) -> Result<Committed> {
        let (cart_table, item_table) = (kind.cart_table(), kind.item_table());
        let cart = changes.cart;
        let mut tx = self.db.begin().await?;

        let (cart_id, version) = if cart.id == 0 {
            let sql = format!(
                "INSERT INTO {} (code, buyer_id, shop_id, payment_opt, deliver_opt, deliver_id, version, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $8) RETURNING id, version", cart_table);
            sqlx::query_as::<_, (i64, i32)>(&sql)
                .bind(&cart.code).bind(cart.buyer_id).bind(cart.shop_id).bind(cart.payment_opt)
                .bind(cart.deliver_opt).bind(cart.deliver_id).bind(cart.created_at).bind(cart.updated_at)
                .fetch_one(&mut *tx).await.map_err(conflict_or_storage(0))?
        } else {
            let sql = format!(
                "UPDATE {} SET code = $2, buyer_id = $3, shop_id = $4, payment_opt = $5, deliver_opt = $6, \
                 deliver_id = $7, updated_at = $8, version = version + 1 WHERE id = $1 AND version = $9 \
                 RETURNING id, version", cart_table);
            let row: Option<(i64, i32)> = sqlx::query_as(&sql)
                .bind(cart.id).bind(&cart.code).bind(cart.buyer_id).bind(cart.shop_id).bind(cart.payment_opt)
                .bind(cart.deliver_opt).bind(cart.deliver_id).bind(cart.updated_at).bind(cart.version)
                .fetch_optional(&mut *tx).await.map_err(conflict_or_storage(cart.id))?;
            match row {
                Some(row) => row,
                None => {
                    let exists: Option<(i64,)> = sqlx::query_as(&format!("SELECT id FROM {} WHERE id = $1", cart_table))
                        .bind(cart.id).fetch_optional(&mut *tx).await?;
                    if exists.is_none() { return Err(CartError::CartNotFound); }
                    warn!(cart_id = cart.id, version = cart.version, "stale cart row");
                    return Err(CartError::Conflict(cart.id));
                }
            }
        };

        // deletes go first so a pair removed and re-added in one commit
        // does not trip the (cart_id, item_id, sku_id) index
        if !changes.deletes.is_empty() {
            let sql = format!("DELETE FROM {} WHERE id = ANY($1)", item_table);
            sqlx::query(&sql).bind(changes.deletes.as_slice()).execute(&mut *tx).await?;
        }

        let mut lines = Vec::with_capacity(changes.upserts.len());
        for item in &changes.upserts {
            let saved: Option<(i64, i32)> = if item.is_new() {
                let sql = format!(
                    "INSERT INTO {} (cart_id, vendor_id, shop_id, item_id, sku_id, quantity, checked, version) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, 0) RETURNING id, version", item_table);
                sqlx::query_as(&sql)
                    .bind(cart_id).bind(item.vendor_id).bind(item.shop_id).bind(item.item_id)
                    .bind(item.sku_id).bind(item.quantity).bind(item.checked)
                    .fetch_optional(&mut *tx).await.map_err(conflict_or_storage(cart_id))?
            } else {
                let sql = format!(
                    "UPDATE {} SET cart_id = $2, vendor_id = $3, shop_id = $4, quantity = $5, checked = $6, \
                     version = version + 1 WHERE id = $1 AND version = $7 RETURNING id, version", item_table);
                sqlx::query_as(&sql)
                    .bind(item.id).bind(cart_id).bind(item.vendor_id).bind(item.shop_id)
                    .bind(item.quantity).bind(item.checked).bind(item.version)
                    .fetch_optional(&mut *tx).await.map_err(conflict_or_storage(cart_id))?
            };
            match saved {
                Some(line) => lines.push(line),
                None => {
                    warn!(cart_id, line_id = item.id, version = item.version, "stale cart line");
                    return Err(CartError::Conflict(cart_id));
                }
            }
        }

        // a source cart written since it was read still holds lines this merge
        // never saw
        if let Some(discard) = changes.discard.filter(|d| d.cart_id != cart_id) {
            let gone = sqlx::query(&format!("DELETE FROM {} WHERE id = $1 AND version = $2", cart_table))
                .bind(discard.cart_id).bind(discard.version).execute(&mut *tx).await?;
            if gone.rows_affected() == 0 {
                warn!(cart_id, from_cart_id = discard.cart_id, "merge source changed since it was read");
                return Err(CartError::Conflict(discard.cart_id));
            }
            sqlx::query(&format!("DELETE FROM {} WHERE cart_id = $1", item_table))
                .bind(discard.cart_id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(Committed { cart_id, version, lines })
    }

    async fn delete_cart(&self, kind: CartKind, id: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!("DELETE FROM {} WHERE cart_id = $1", kind.item_table()))
            .bind(id).execute(&mut *tx).await?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = $1", kind.cart_table()))
            .bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Catalog, shop and address lookups against the platform's own tables.
#[derive(Clone, Debug)]
pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self { Self { db } }
}

#[async_trait]
impl Catalog for PgDirectory {
    async fn get_sku(&self, item_id: i64, sku_id: i64) -> Result<Option<SkuSnapshot>> {
        Ok(sqlx::query_as::<_, SkuSnapshot>(
            "SELECT item_id, sku_id, shop_id, vendor_id, title, image, price, retail_price, stock, spec_word, code \
             FROM item_sku_snapshot WHERE item_id = $1 AND sku_id = $2")
            .bind(item_id).bind(sku_id).fetch_optional(&self.db).await?)
    }
}

#[async_trait]
impl MemberDirectory for PgDirectory {
    async fn get_address(&self, buyer_id: i64, address_id: i64) -> Result<Option<DeliverAddress>> {
        Ok(sqlx::query_as::<_, DeliverAddress>(
            "SELECT id, member_id AS buyer_id, consignee, phone, area, address \
             FROM member_deliver_address WHERE id = $1 AND member_id = $2")
            .bind(address_id).bind(buyer_id).fetch_optional(&self.db).await?)
    }
}

#[async_trait]
impl ShopDirectory for PgDirectory {
    async fn get_shop(&self, shop_id: i64) -> Result<Option<Shop>> {
        Ok(sqlx::query_as::<_, Shop>("SELECT id, vendor_id, name FROM shops WHERE id = $1")
            .bind(shop_id).fetch_optional(&self.db).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_where() {
        let (clause, args) = line_where(LineFilter::Line { cart_id: 1, item_id: 2, sku_id: 3 });
        assert_eq!(clause, "cart_id = $1 AND item_id = $2 AND sku_id = $3");
        assert_eq!(args, vec![1, 2, 3]);
        assert_eq!(line_where(LineFilter::Cart(9)).1, vec![9]);
    }
}
