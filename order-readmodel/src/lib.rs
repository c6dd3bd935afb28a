//! The query-side read model: a denormalized Postgres schema kept in sync
//! with the event stream by the projection consumer, and the idempotent
//! apply operations it uses to do so.
#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use order_domain::OrderItem;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

/// Errors returned by read-model operations.
#[derive(Debug, thiserror::Error)]
pub enum ReadModelError {
    /// The underlying Postgres operation failed.
    #[error("read model store error: {0}")]
    Store(#[from] sqlx::Error),
    /// An `f64` amount could not be represented as a `DECIMAL(18,2)`.
    #[error("amount {0} is not representable as a decimal")]
    InvalidAmount(f64),
}

/// The result of attempting to apply one event to the read model.
///
/// Mirrors the projection consumer's idempotence & out-of-order policy: the
/// store itself decides duplicate vs. apply vs. "this aggregate is missing
/// its predecessor", and the caller (the projector) is responsible for
/// parking on the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was new and has been applied.
    Applied,
    /// `version` was less than or equal to the row's last-applied version;
    /// no write was performed.
    Duplicate,
    /// The aggregate's row either does not exist yet, or its last-applied
    /// version is not immediately prior to this event's version. The caller
    /// should park the event and retry once `expected_version` has been
    /// applied.
    Parked {
        /// The version the read model is actually waiting for next.
        expected_version: i64,
    },
}

/// A handle to the order read model's connection pool.
#[derive(Debug, Clone)]
pub struct ReadModelStore {
    pool: PgPool,
}

impl ReadModelStore {
    /// Wraps an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `orders`, `order_items` and `order_status_history`
    /// tables and their required indexes if they do not already exist.
    ///
    /// `last_applied_version` is not part of the read model's contractual
    /// column set but is required to implement the idempotence policy; see
    /// the design notes for why it lives on `orders` rather than a
    /// side table.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<(), ReadModelError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                customer_id UUID NOT NULL,
                total_amount DECIMAL(18,2) NOT NULL,
                shipping_address TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                payment_id UUID,
                payment_method TEXT,
                shipment_id UUID,
                tracking_number TEXT,
                last_applied_version BIGINT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS orders_customer_id_idx ON orders (customer_id);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS orders_status_idx ON orders (status);")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS orders_created_at_idx ON orders (created_at);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_items (
                id UUID PRIMARY KEY,
                order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                product_id UUID NOT NULL,
                product_name VARCHAR(200) NOT NULL,
                quantity INTEGER NOT NULL,
                unit_price DECIMAL(18,2) NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_status_history (
                id UUID PRIMARY KEY,
                order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                status TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                reason VARCHAR(500)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS order_status_history_order_id_timestamp_idx \
             ON order_status_history (order_id, timestamp);",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Applies a `Created` event. Inserts the order row, its item rows, and
    /// the initial status-history row. `version` is always the first
    /// version of a fresh stream.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::InvalidAmount` if `total_amount` or an
    /// item's `unit_price` cannot be represented as `DECIMAL(18,2)`, or
    /// `ReadModelError::Store` on any database failure.
    #[instrument(skip(self, items))]
    pub async fn apply_created(
        &self,
        order_id: Uuid,
        version: i64,
        customer_id: Uuid,
        items: &[OrderItem],
        total_amount: f64,
        shipping_address: &str,
        created_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        let mut tx = self.pool.begin().await?;

        let existing = current_version(&mut tx, order_id).await?;
        if existing.is_some() {
            tx.commit().await?;
            return Ok(ApplyOutcome::Duplicate);
        }

        let total_amount_dec = to_decimal(total_amount)?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                id, customer_id, total_amount, shipping_address, status,
                created_at, updated_at, last_applied_version
            ) VALUES ($1, $2, $3, $4, 'created', $5, $5, $6)
            "#,
        )
        .bind(order_id)
        .bind(customer_id)
        .bind(total_amount_dec)
        .bind(shipping_address)
        .bind(created_at)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        for item in items {
            let unit_price = to_decimal(item.unit_price)?;
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, product_name, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(i32::try_from(item.quantity).unwrap_or(i32::MAX))
            .bind(unit_price)
            .execute(&mut *tx)
            .await?;
        }

        insert_history(&mut tx, order_id, "created", created_at, None).await?;

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Applies a `Paid` event.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::Store` on any database failure.
    #[instrument(skip(self))]
    pub async fn apply_paid(
        &self,
        order_id: Uuid,
        version: i64,
        payment_id: Uuid,
        payment_method: &str,
        paid_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        self.apply_transition(order_id, version, "paid", paid_at, None, |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET status = 'paid', updated_at = $2, payment_id = $3,
                        payment_method = $4, last_applied_version = $5
                    WHERE id = $1
                    "#,
                )
                .bind(order_id)
                .bind(paid_at)
                .bind(payment_id)
                .bind(payment_method)
                .bind(version)
                .execute(&mut **tx)
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// Applies a `Shipped` event.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::Store` on any database failure.
    #[instrument(skip(self))]
    pub async fn apply_shipped(
        &self,
        order_id: Uuid,
        version: i64,
        shipment_id: Uuid,
        tracking_number: &str,
        shipped_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        self.apply_transition(order_id, version, "shipped", shipped_at, None, |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET status = 'shipped', updated_at = $2, shipment_id = $3,
                        tracking_number = $4, last_applied_version = $5
                    WHERE id = $1
                    "#,
                )
                .bind(order_id)
                .bind(shipped_at)
                .bind(shipment_id)
                .bind(tracking_number)
                .bind(version)
                .execute(&mut **tx)
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// Applies a `Cancelled` event.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::Store` on any database failure.
    #[instrument(skip(self))]
    pub async fn apply_cancelled(
        &self,
        order_id: Uuid,
        version: i64,
        reason: &str,
        cancelled_at: DateTime<Utc>,
    ) -> Result<ApplyOutcome, ReadModelError> {
        self.apply_transition(order_id, version, "cancelled", cancelled_at, Some(reason), |tx| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    UPDATE orders
                    SET status = 'cancelled', updated_at = $2, last_applied_version = $3
                    WHERE id = $1
                    "#,
                )
                .bind(order_id)
                .bind(cancelled_at)
                .bind(version)
                .execute(&mut **tx)
                .await?;
                Ok(())
            })
        })
        .await
    }

    /// Shared skeleton for the three non-`Created` transitions: read the
    /// current last-applied version, classify the event against it, and
    /// either no-op (duplicate), park (missing predecessor / gap), or run
    /// `update` plus append a status-history row inside the same
    /// transaction.
    async fn apply_transition<'a, F>(
        &self,
        order_id: Uuid,
        version: i64,
        kind: &str,
        timestamp: DateTime<Utc>,
        reason: Option<&'a str>,
        update: F,
    ) -> Result<ApplyOutcome, ReadModelError>
    where
        F: for<'t> FnOnce(
            &'t mut sqlx::Transaction<'_, sqlx::Postgres>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<(), sqlx::Error>> + Send + 't>,
        >,
    {
        let mut tx = self.pool.begin().await?;

        match current_version(&mut tx, order_id).await? {
            None => {
                tx.commit().await?;
                return Ok(ApplyOutcome::Parked { expected_version: 1 });
            }
            Some(last) if version <= last => {
                tx.commit().await?;
                return Ok(ApplyOutcome::Duplicate);
            }
            Some(last) if version > last + 1 => {
                tx.commit().await?;
                return Ok(ApplyOutcome::Parked {
                    expected_version: last + 1,
                });
            }
            Some(_) => {}
        }

        update(&mut tx).await?;
        insert_history(&mut tx, order_id, kind, timestamp, reason).await?;

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    /// Fetches an order row for inspection, used by command-side callers
    /// that need to confirm a projection has caught up and by tests.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::Store` on any database failure.
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderRow>, ReadModelError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT id, customer_id, status, last_applied_version
            FROM orders WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Counts status-history rows for an order, used by tests asserting no
    /// duplicate rows were written on replay.
    ///
    /// # Errors
    ///
    /// Returns `ReadModelError::Store` on any database failure.
    pub async fn status_history_count(&self, order_id: Uuid) -> Result<i64, ReadModelError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM order_status_history WHERE order_id = $1")
                .bind(order_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// A denormalized view of one `orders` row, projected down to the fields
/// tests and read-path callers most commonly need.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrderRow {
    /// Order identifier.
    pub id: Uuid,
    /// Customer who placed the order.
    pub customer_id: Uuid,
    /// Current lifecycle status, lowercase (`created`, `paid`, ...).
    pub status: String,
    /// The version of the last event applied to this row.
    pub last_applied_version: i64,
}

fn to_decimal(amount: f64) -> Result<Decimal, ReadModelError> {
    Decimal::from_f64(amount)
        .map(|d| d.round_dp(2))
        .ok_or(ReadModelError::InvalidAmount(amount))
}

async fn current_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    order_id: Uuid,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT last_applied_version FROM orders WHERE id = $1 FOR UPDATE")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_decimal_rounds_to_two_places() {
        let d = to_decimal(19.996).unwrap();
        assert_eq!(d, Decimal::new(2000, 2));
    }

    #[test]
    fn to_decimal_rejects_non_finite() {
        assert!(matches!(
            to_decimal(f64::NAN),
            Err(ReadModelError::InvalidAmount(_))
        ));
        assert!(matches!(
            to_decimal(f64::INFINITY),
            Err(ReadModelError::InvalidAmount(_))
        ));
    }
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    order_id: Uuid,
    status: &str,
    timestamp: DateTime<Utc>,
    reason: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO order_status_history (id, order_id, status, timestamp, reason)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(order_id)
    .bind(status)
    .bind(timestamp)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
