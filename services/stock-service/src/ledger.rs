//! Ledger primitives: the append-only `stock_movements` table is the source
//! of truth, `products.stock` is a materialized counter kept in step with it
//! inside the same transaction. Everything that mutates stock goes through
//! `lock_product` first so the product row lock orders concurrent writers.

use std::collections::HashMap;

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use common_observability::LedgerMetrics;

use crate::movement::LedgerError;

pub(crate) const LEDGER_STOCK_SQL: &str =
    "SELECT COALESCE(SUM(CASE WHEN direction = 'IN' THEN quantity ELSE -quantity END), 0)::float8 \
     FROM stock_movements WHERE product_id = $1";

pub(crate) const LEDGER_STOCK_MAP_SQL: &str =
    "SELECT product_id, SUM(CASE WHEN direction = 'IN' THEN quantity ELSE -quantity END)::float8 AS qty \
     FROM stock_movements WHERE product_id = ANY($1) GROUP BY product_id";

pub(crate) const DIVERGED_PRODUCTS_SQL: &str =
    "SELECT p.id FROM products p \
     LEFT JOIN stock_movements m ON m.product_id = p.id \
     GROUP BY p.id, p.stock \
     HAVING p.stock IS DISTINCT FROM \
       COALESCE(SUM(CASE WHEN m.direction = 'IN' THEN m.quantity ELSE -m.quantity END), 0)";

#[derive(Debug, sqlx::FromRow)]
pub struct ProductRow {
    pub id: Uuid,
    pub product_code: Option<String>,
    pub name: Option<String>,
    pub sale_price: Option<f64>,
    pub stock: f64,
}

/// Row-locks the product. All movement appliers call this before touching
/// lots or the ledger, so the lock order is always product then lot.
pub async fn lock_product(
    conn: &mut PgConnection,
    product_id: Uuid,
) -> Result<ProductRow, LedgerError> {
    sqlx::query_as::<_, ProductRow>(
        "SELECT id, product_code, name, sale_price, stock FROM products WHERE id = $1 FOR UPDATE",
    )
    .bind(product_id)
    .fetch_optional(conn)
    .await
    .map_err(LedgerError::classify)?
    .ok_or(LedgerError::ProductNotFound(product_id))
}

/// Aggregates the ledger for one product: sum of IN minus sum of OUT.
pub async fn compute_stock<'e, E>(executor: E, product_id: Uuid) -> Result<f64, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_scalar::<_, f64>(LEDGER_STOCK_SQL)
        .bind(product_id)
        .fetch_one(executor)
        .await
}

/// Ledger aggregation for a set of products in one round trip. Products with
/// no movements are absent from the map; callers treat that as zero.
pub async fn compute_stock_map<'e, E>(
    executor: E,
    product_ids: &[Uuid],
) -> Result<HashMap<Uuid, f64>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let rows: Vec<(Uuid, f64)> = sqlx::query_as(LEDGER_STOCK_MAP_SQL)
        .bind(product_ids)
        .fetch_all(executor)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Bumps the materialized counter and returns the new value. The caller must
/// already hold the product row lock; a negative result means the OUT check
/// raced something it should not have, so we reject rather than persist it.
pub async fn apply_delta(
    conn: &mut PgConnection,
    product_id: Uuid,
    delta: f64,
) -> Result<f64, LedgerError> {
    let new_stock: f64 = sqlx::query_scalar(
        "UPDATE products SET stock = stock + $2, updated_at = NOW() WHERE id = $1 RETURNING stock",
    )
    .bind(product_id)
    .bind(delta)
    .fetch_optional(conn)
    .await
    .map_err(LedgerError::classify)?
    .ok_or(LedgerError::ProductNotFound(product_id))?;
    if new_stock < 0.0 {
        return Err(LedgerError::InsufficientStock {
            product_id,
            current: new_stock - delta,
            requested: -delta,
        });
    }
    Ok(new_stock)
}

/// Periodic sweep: finds products whose counter no longer matches the ledger
/// aggregation and rewrites the counter from the ledger under the row lock.
/// Returns how many counters were healed.
pub async fn audit_and_heal(db: &PgPool, metrics: &LedgerMetrics) -> Result<u64, sqlx::Error> {
    let diverged: Vec<Uuid> = sqlx::query_scalar(DIVERGED_PRODUCTS_SQL).fetch_all(db).await?;
    let mut healed = 0u64;
    for product_id in diverged {
        let _timer = metrics.heal_latency_seconds.start_timer();
        let mut tx = db.begin().await?;
        let counter: Option<f64> =
            sqlx::query_scalar("SELECT stock FROM products WHERE id = $1 FOR UPDATE")
                .bind(product_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(counter) = counter else {
            // Deleted between the scan and the lock.
            continue;
        };
        let ledger = compute_stock(&mut *tx, product_id).await?;
        if counter == ledger {
            // A concurrent writer already brought them back in step.
            tx.rollback().await?;
            continue;
        }
        sqlx::query("UPDATE products SET stock = $2, updated_at = NOW() WHERE id = $1")
            .bind(product_id)
            .bind(ledger)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        metrics.ledger_divergence.inc();
        tracing::warn!(
            product_id = %product_id,
            counter,
            ledger,
            "stock counter diverged from ledger; healed from aggregation"
        );
        healed += 1;
    }
    Ok(healed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_sql_nets_out_against_in() {
        assert!(LEDGER_STOCK_SQL.contains("WHEN direction = 'IN' THEN quantity ELSE -quantity"));
        assert!(LEDGER_STOCK_SQL.contains("COALESCE"), "empty ledger must read as zero");
    }

    #[test]
    fn divergence_scan_treats_missing_movements_as_zero() {
        assert!(DIVERGED_PRODUCTS_SQL.contains("LEFT JOIN stock_movements"));
        assert!(DIVERGED_PRODUCTS_SQL.contains("IS DISTINCT FROM"));
    }
}
