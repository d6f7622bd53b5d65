use anyhow::{Context, Result};
use async_trait::async_trait;
use scylla::{FromRow, Session, SessionBuilder};
use std::sync::Arc;

use super::{RepoResult, Repository};
use crate::configure::ScyllaDbConfig;
use crate::error::RepoError;
use crate::id_gen::IdGenerator;
use crate::models::{
    CouponWindow, FlashCoupon, NewFlashCoupon, OrderQueueEntry, OrderStatus, PersistedOrder, Shop,
};

const CREATE_SHOPS_CQL: &str = "
    CREATE TABLE IF NOT EXISTS shops (
        id bigint PRIMARY KEY,
        name text, type_id bigint, images text, area text, address text,
        x double, y double, avg_price bigint, sold bigint, comments bigint,
        score bigint, open_hours text
    )
";

const CREATE_USERS_CQL: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id bigint PRIMARY KEY,
        nick_name text
    )
";

const CREATE_COUPONS_CQL: &str = "
    CREATE TABLE IF NOT EXISTS flash_coupons (
        id bigint PRIMARY KEY,
        shop_id bigint, title text, sub_title text, rules text,
        pay_value bigint, actual_value bigint, stock bigint,
        begin_ms bigint, end_ms bigint
    )
";

// One partition per coupon; the clustering key makes (coupon, buyer) unique.
const CREATE_ORDERS_CQL: &str = "
    CREATE TABLE IF NOT EXISTS flash_orders (
        coupon_id bigint,
        buyer_id bigint,
        order_id bigint,
        token text,
        status text,
        created_at bigint,
        updated_at bigint,
        PRIMARY KEY ((coupon_id), buyer_id)
    )
";

const INSERT_ORDER_CQL: &str = "
    INSERT INTO flash_orders (
        coupon_id, buyer_id, order_id, token, status, created_at, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?)
    IF NOT EXISTS
";

const SELECT_ORDER_CQL: &str = "
    SELECT order_id, buyer_id, coupon_id, token, status, created_at, updated_at
    FROM flash_orders
    WHERE coupon_id = ? AND buyer_id = ?
";

const COUNT_ORDERS_CQL: &str = "SELECT COUNT(*) FROM flash_orders WHERE coupon_id = ?";

const INSERT_COUPON_CQL: &str = "
    INSERT INTO flash_coupons (
        id, shop_id, title, sub_title, rules, pay_value, actual_value, stock, begin_ms, end_ms
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

const SELECT_COUPON_CQL: &str = "
    SELECT id, shop_id, title, pay_value, actual_value, stock, begin_ms, end_ms
    FROM flash_coupons
    WHERE id = ?
";

const SELECT_SHOP_CQL: &str = "
    SELECT id, name, type_id, images, area, address, x, y,
           avg_price, sold, comments, score, open_hours
    FROM shops
    WHERE id = ?
";

const INSERT_SHOP_CQL: &str = "
    INSERT INTO shops (
        id, name, type_id, images, area, address, x, y,
        avg_price, sold, comments, score, open_hours
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    IF NOT EXISTS
";

const UPDATE_SHOP_CQL: &str = "
    UPDATE shops
    SET name = ?, type_id = ?, images = ?, area = ?, address = ?, x = ?, y = ?,
        avg_price = ?, sold = ?, comments = ?, score = ?, open_hours = ?
    WHERE id = ?
    IF EXISTS
";

#[derive(Debug, Clone, FromRow)]
struct OrderRow {
    order_id: i64,
    buyer_id: i64,
    coupon_id: i64,
    token: String,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<OrderRow> for PersistedOrder {
    type Error = RepoError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::from_str(&row.status)
            .ok_or_else(|| RepoError::Corrupt(format!("unknown order status {}", row.status)))?;
        Ok(PersistedOrder {
            order_id: row.order_id as u64,
            buyer_id: row.buyer_id as u64,
            coupon_id: row.coupon_id as u64,
            token: row.token,
            status,
            created_at_ms: row.created_at,
            updated_at_ms: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct CouponRow {
    id: i64,
    shop_id: i64,
    title: Option<String>,
    pay_value: i64,
    actual_value: i64,
    stock: i64,
    begin_ms: i64,
    end_ms: i64,
}

#[derive(Debug, Clone, FromRow)]
struct ShopRow {
    id: i64,
    name: Option<String>,
    type_id: Option<i64>,
    images: Option<String>,
    area: Option<String>,
    address: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
    avg_price: Option<i64>,
    sold: Option<i64>,
    comments: Option<i64>,
    score: Option<i64>,
    open_hours: Option<String>,
}

impl From<ShopRow> for Shop {
    fn from(row: ShopRow) -> Self {
        Shop {
            id: row.id as u64,
            name: row.name.unwrap_or_default(),
            type_id: row.type_id.unwrap_or_default() as u64,
            images: row.images.unwrap_or_default(),
            area: row.area.unwrap_or_default(),
            address: row.address.unwrap_or_default(),
            x: row.x.unwrap_or_default(),
            y: row.y.unwrap_or_default(),
            avg_price: row.avg_price.unwrap_or_default(),
            sold: row.sold.unwrap_or_default(),
            comments: row.comments.unwrap_or_default(),
            score: row.score.unwrap_or_default(),
            open_hours: row.open_hours.unwrap_or_default(),
        }
    }
}

/// ScyllaDB-backed system of record
#[derive(Clone)]
pub struct ScyllaRepository {
    session: Arc<Session>,
    ids: Arc<IdGenerator>,
}

impl ScyllaRepository {
    /// Connect to ScyllaDB
    pub async fn connect(config: &ScyllaDbConfig, ids: Arc<IdGenerator>) -> Result<Self> {
        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .build()
            .await
            .context("Failed to connect to ScyllaDB")?;
        session
            .use_keyspace(&config.keyspace, false)
            .await
            .with_context(|| format!("Failed to use keyspace {}", config.keyspace))?;

        log::info!("Connected to ScyllaDB {:?}, keyspace {}", config.hosts, config.keyspace);

        Ok(Self { session: Arc::new(session), ids })
    }

    pub fn from_session(session: Arc<Session>, ids: Arc<IdGenerator>) -> Self {
        Self { session, ids }
    }

    /// Create the tables this crate owns if they are missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for cql in [CREATE_SHOPS_CQL, CREATE_USERS_CQL, CREATE_COUPONS_CQL, CREATE_ORDERS_CQL] {
            self.session.query(cql, &[]).await.context("Failed to create table")?;
        }
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<bool> {
        self.session.query("SELECT now() FROM system.local", &[]).await?;
        Ok(true)
    }

    async fn scan_ids(&self, cql: &str) -> RepoResult<Vec<u64>> {
        let result = self.session.query(cql, &[]).await?;
        let mut ids = Vec::new();
        if let Some(rows) = result.rows {
            ids.reserve(rows.len());
            for row in rows {
                let (id,) = row.into_typed::<(i64,)>()?;
                ids.push(id as u64);
            }
        }
        Ok(ids)
    }

    /// Read the `[applied]` column of a lightweight-transaction result
    fn applied(result: &scylla::QueryResult) -> bool {
        result
            .rows
            .as_ref()
            .and_then(|rows| rows.first())
            .and_then(|row| row.columns.first())
            .and_then(|col| col.as_ref())
            .and_then(|v| v.as_boolean())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Repository for ScyllaRepository {
    async fn load_coupon(&self, coupon_id: u64) -> RepoResult<Option<FlashCoupon>> {
        let result = self.session.query(SELECT_COUPON_CQL, (coupon_id as i64,)).await?;
        let Some(row) = result.rows.and_then(|rows| rows.into_iter().next()) else {
            return Ok(None);
        };
        let row: CouponRow = row.into_typed()?;
        Ok(Some(FlashCoupon {
            id: row.id as u64,
            shop_id: row.shop_id as u64,
            title: row.title.unwrap_or_default(),
            pay_value: row.pay_value,
            actual_value: row.actual_value,
            window: CouponWindow::new(row.begin_ms, row.end_ms),
            stock: row.stock,
        }))
    }

    async fn create_coupon(&self, coupon: &NewFlashCoupon) -> RepoResult<u64> {
        let id = self.ids.next_id();
        self.session
            .query(
                INSERT_COUPON_CQL,
                (
                    id as i64,
                    coupon.shop_id as i64,
                    &coupon.title,
                    &coupon.sub_title,
                    &coupon.rules,
                    coupon.pay_value,
                    coupon.actual_value,
                    coupon.stock,
                    coupon.begin_ms,
                    coupon.end_ms,
                ),
            )
            .await?;
        Ok(id)
    }

    async fn count_orders(&self, coupon_id: u64) -> RepoResult<u64> {
        let result = self.session.query(COUNT_ORDERS_CQL, (coupon_id as i64,)).await?;
        let count = match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row.into_typed::<(i64,)>()?.0,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn create_order(&self, entry: &OrderQueueEntry) -> RepoResult<u64> {
        let order_id = self.ids.next_id();
        let now = chrono::Utc::now().timestamp_millis();
        let result = self
            .session
            .query(
                INSERT_ORDER_CQL,
                (
                    entry.coupon_id as i64,
                    entry.buyer_id as i64,
                    order_id as i64,
                    &entry.token,
                    OrderStatus::Unpaid.as_str(),
                    now,
                    now,
                ),
            )
            .await?;

        if Self::applied(&result) {
            return Ok(order_id);
        }

        match self.find_order(entry.buyer_id, entry.coupon_id).await? {
            Some(existing) => Err(RepoError::DuplicateOrder { existing }),
            None => Err(RepoError::Unavailable(format!(
                "order insert for buyer {} coupon {} not applied and no row found",
                entry.buyer_id, entry.coupon_id
            ))),
        }
    }

    async fn find_order(&self, buyer_id: u64, coupon_id: u64) -> RepoResult<Option<PersistedOrder>> {
        let result = self
            .session
            .query(SELECT_ORDER_CQL, (coupon_id as i64, buyer_id as i64))
            .await?;
        match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => {
                let row: OrderRow = row.into_typed()?;
                Ok(Some(row.try_into()?))
            }
            None => Ok(None),
        }
    }

    async fn all_shop_ids(&self) -> RepoResult<Vec<u64>> {
        self.scan_ids("SELECT id FROM shops").await
    }

    async fn all_user_ids(&self) -> RepoResult<Vec<u64>> {
        self.scan_ids("SELECT id FROM users").await
    }

    async fn all_coupon_ids(&self) -> RepoResult<Vec<u64>> {
        self.scan_ids("SELECT id FROM flash_coupons").await
    }

    async fn load_shop(&self, shop_id: u64) -> RepoResult<Option<Shop>> {
        let result = self.session.query(SELECT_SHOP_CQL, (shop_id as i64,)).await?;
        match result.rows.and_then(|rows| rows.into_iter().next()) {
            Some(row) => Ok(Some(row.into_typed::<ShopRow>()?.into())),
            None => Ok(None),
        }
    }

    async fn save_shop(&self, shop: &Shop) -> RepoResult<()> {
        let result = self
            .session
            .query(
                UPDATE_SHOP_CQL,
                (
                    &shop.name,
                    shop.type_id as i64,
                    &shop.images,
                    &shop.area,
                    &shop.address,
                    shop.x,
                    shop.y,
                    shop.avg_price,
                    shop.sold,
                    shop.comments,
                    shop.score,
                    &shop.open_hours,
                    shop.id as i64,
                ),
            )
            .await?;

        if Self::applied(&result) {
            Ok(())
        } else {
            Err(RepoError::NotFound(shop.id))
        }
    }

    async fn create_shop(&self, shop: &Shop) -> RepoResult<u64> {
        let id = if shop.id == 0 { self.ids.next_id() } else { shop.id };
        let result = self
            .session
            .query(
                INSERT_SHOP_CQL,
                (
                    id as i64,
                    &shop.name,
                    shop.type_id as i64,
                    &shop.images,
                    &shop.area,
                    &shop.address,
                    shop.x,
                    shop.y,
                    shop.avg_price,
                    shop.sold,
                    shop.comments,
                    shop.score,
                    &shop.open_hours,
                ),
            )
            .await?;

        if Self::applied(&result) {
            Ok(id)
        } else {
            Err(RepoError::Invalid(format!("shop {} already exists", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_row_conversion() {
        let row = OrderRow {
            order_id: 11,
            buyer_id: 4001,
            coupon_id: 7,
            token: "0ABC".to_string(),
            status: "unpaid".to_string(),
            created_at: 1_702_345_678_000,
            updated_at: 1_702_345_678_000,
        };
        let order = PersistedOrder::try_from(row.clone()).unwrap();
        assert_eq!(order.order_id, 11);
        assert_eq!(order.status, OrderStatus::Unpaid);

        let bad = OrderRow { status: "shipped".to_string(), ..row };
        assert!(matches!(PersistedOrder::try_from(bad), Err(RepoError::Corrupt(_))));
    }

    #[test]
    fn test_shop_row_defaults_missing_columns() {
        let row = ShopRow {
            id: 3,
            name: Some("tea house".to_string()),
            type_id: None,
            images: None,
            area: None,
            address: None,
            x: Some(120.1),
            y: None,
            avg_price: Some(55),
            sold: None,
            comments: None,
            score: None,
            open_hours: None,
        };
        let shop: Shop = row.into();
        assert_eq!(shop.id, 3);
        assert_eq!(shop.name, "tea house");
        assert_eq!(shop.avg_price, 55);
        assert_eq!(shop.address, "");
    }
}
