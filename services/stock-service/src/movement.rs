//! Movement application: one normalized event in, one ledger append plus the
//! matching counter/lot/invoice updates out, all on the caller's connection
//! (a savepoint during sync, the outer transaction for single-shot endpoints).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use common_http_errors::ApiError;

use crate::ledger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A movement after normalization: the three client shapes (movements,
/// stock_ins, invoice_items) all collapse into this.
#[derive(Debug, Clone, Serialize)]
pub struct MovementEvent {
    pub direction: Direction,
    pub product_id: Uuid,
    pub quantity: f64,
    pub lot_id: Option<Uuid>,
    pub expiry_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    pub warranty: Option<String>,
    pub unit_price: Option<f64>,
    pub invoice_id: Option<Uuid>,
    pub issued_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    pub device_id: Option<String>,
}

#[derive(Debug)]
pub struct AppliedMovement {
    pub movement_id: Uuid,
    pub lot_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub invoice_item_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Product not found.")]
    ProductNotFound(Uuid),
    #[error("Lot not found.")]
    LotNotFound(Uuid),
    #[error("Lot does not match product.")]
    LotProductMismatch { lot_id: Uuid, product_id: Uuid },
    #[error("Insufficient stock.")]
    InsufficientStock { product_id: Uuid, current: f64, requested: f64 },
    #[error("Insufficient lot quantity.")]
    InsufficientLotQuantity { lot_id: Uuid, remaining: f64, requested: f64 },
    #[error("Lock wait timed out; event may be retried.")]
    LockTimeout,
    #[error("database error: {0}")]
    Db(sqlx::Error),
}

impl LedgerError {
    /// No `#[from]` on `Db` on purpose: every sqlx error passes through here
    /// so lock timeouts (SQLSTATE 55P03) surface as the retryable variant.
    pub(crate) fn classify(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.code().as_deref() == Some("55P03") {
                return LedgerError::LockTimeout;
            }
        }
        LedgerError::Db(err)
    }

    /// Stable code for metrics labels and event-level error reporting.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidInput(_) => "invalid_movement",
            LedgerError::ProductNotFound(_) => "product_not_found",
            LedgerError::LotNotFound(_) => "lot_not_found",
            LedgerError::LotProductMismatch { .. } => "lot_mismatch",
            LedgerError::InsufficientStock { .. } => "insufficient_stock",
            LedgerError::InsufficientLotQuantity { .. } => "insufficient_lot_quantity",
            LedgerError::LockTimeout => "lock_timeout",
            LedgerError::Db(_) => "db_error",
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::InvalidInput(_) => ApiError::bad_request("invalid_movement", message),
            LedgerError::ProductNotFound(_) => ApiError::not_found("product_not_found"),
            LedgerError::LotNotFound(_) => ApiError::not_found("lot_not_found"),
            LedgerError::LotProductMismatch { .. } => ApiError::unprocessable("lot_mismatch", message),
            LedgerError::InsufficientStock { .. } => {
                ApiError::unprocessable("insufficient_stock", message)
            }
            LedgerError::InsufficientLotQuantity { .. } => {
                ApiError::unprocessable("insufficient_lot_quantity", message)
            }
            LedgerError::LockTimeout => ApiError::unprocessable("lock_timeout", message),
            LedgerError::Db(e) => ApiError::internal(e, None),
        }
    }
}

/// Applies one movement on the given connection. The product row is locked
/// first; everything after that (lot, ledger append, counter, invoice rows)
/// happens under that lock.
pub async fn apply_movement(
    conn: &mut PgConnection,
    event: &MovementEvent,
) -> Result<AppliedMovement, LedgerError> {
    if !(event.quantity > 0.0) {
        return Err(LedgerError::InvalidInput(format!(
            "Invalid {} movement: quantity must be positive.",
            event.direction
        )));
    }
    let product = ledger::lock_product(&mut *conn, event.product_id).await?;
    match event.direction {
        Direction::In => apply_stock_in(conn, &product, event).await,
        Direction::Out => apply_stock_out(conn, &product, event).await,
    }
}

async fn apply_stock_in(
    conn: &mut PgConnection,
    product: &ledger::ProductRow,
    event: &MovementEvent,
) -> Result<AppliedMovement, LedgerError> {
    let mut lot_id = event.lot_id;
    if let Some(id) = event.lot_id {
        adjust_lot(&mut *conn, id, product.id, event.quantity).await?;
    } else if event.expiry_date.is_some() || event.supplier_id.is_some() || event.warranty.is_some()
    {
        // Lot metadata without a lot id: open a fresh lot seeded with this
        // delivery's quantity.
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO lots (id, product_id, expiry_date, supplier_id, warranty, remaining_qty) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(product.id)
        .bind(event.expiry_date)
        .bind(event.supplier_id)
        .bind(event.warranty.as_deref())
        .bind(event.quantity)
        .execute(&mut *conn)
        .await
        .map_err(LedgerError::classify)?;
        lot_id = Some(id);
    }
    let movement_id = insert_movement(&mut *conn, event, lot_id, None).await?;
    ledger::apply_delta(&mut *conn, product.id, event.quantity).await?;
    Ok(AppliedMovement { movement_id, lot_id, invoice_id: None, invoice_item_id: None })
}

async fn apply_stock_out(
    conn: &mut PgConnection,
    product: &ledger::ProductRow,
    event: &MovementEvent,
) -> Result<AppliedMovement, LedgerError> {
    // The counter is read under the product row lock, so this check cannot
    // race another OUT on the same product.
    if product.stock < event.quantity {
        return Err(LedgerError::InsufficientStock {
            product_id: product.id,
            current: product.stock,
            requested: event.quantity,
        });
    }
    if let Some(lot) = event.lot_id {
        adjust_lot(&mut *conn, lot, product.id, -event.quantity).await?;
    }
    let unit_price = resolve_unit_price(event.unit_price, product.sale_price);
    let invoice_id = match event.invoice_id {
        Some(id) => lock_invoice(&mut *conn, id).await?,
        None => None,
    };
    let invoice_id = match invoice_id {
        Some(id) => id,
        None => create_invoice(&mut *conn, event).await?,
    };
    let invoice_item_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO invoice_items (id, invoice_id, product_id, quantity, unit_price) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(invoice_item_id)
    .bind(invoice_id)
    .bind(product.id)
    .bind(event.quantity)
    .bind(unit_price)
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::classify)?;
    sqlx::query("UPDATE invoices SET total_amount = total_amount + $2 WHERE id = $1")
        .bind(invoice_id)
        .bind(event.quantity * unit_price)
        .execute(&mut *conn)
        .await
        .map_err(LedgerError::classify)?;
    let movement_id = insert_movement(&mut *conn, event, event.lot_id, Some(unit_price)).await?;
    ledger::apply_delta(&mut *conn, product.id, -event.quantity).await?;
    Ok(AppliedMovement {
        movement_id,
        lot_id: event.lot_id,
        invoice_id: Some(invoice_id),
        invoice_item_id: Some(invoice_item_id),
    })
}

/// Lot balance adjustment (positive delta on IN, negative on OUT). Locks the
/// lot row after the product row, never the other way around.
pub async fn adjust_lot(
    conn: &mut PgConnection,
    lot_id: Uuid,
    product_id: Uuid,
    delta: f64,
) -> Result<f64, LedgerError> {
    let row = sqlx::query("SELECT product_id, remaining_qty FROM lots WHERE id = $1 FOR UPDATE")
        .bind(lot_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(LedgerError::classify)?
        .ok_or(LedgerError::LotNotFound(lot_id))?;
    let owner: Uuid = row.get("product_id");
    if owner != product_id {
        return Err(LedgerError::LotProductMismatch { lot_id, product_id });
    }
    let remaining: f64 = row.get("remaining_qty");
    let new_remaining = remaining + delta;
    if new_remaining < 0.0 {
        return Err(LedgerError::InsufficientLotQuantity {
            lot_id,
            remaining,
            requested: -delta,
        });
    }
    sqlx::query("UPDATE lots SET remaining_qty = $2, updated_at = NOW() WHERE id = $1")
        .bind(lot_id)
        .bind(new_remaining)
        .execute(conn)
        .await
        .map_err(LedgerError::classify)?;
    Ok(new_remaining)
}

async fn lock_invoice(conn: &mut PgConnection, id: Uuid) -> Result<Option<Uuid>, LedgerError> {
    sqlx::query_scalar("SELECT id FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(LedgerError::classify)
}

async fn create_invoice(conn: &mut PgConnection, event: &MovementEvent) -> Result<Uuid, LedgerError> {
    let id = Uuid::new_v4();
    let issued_at = event.issued_at.unwrap_or_else(Utc::now);
    sqlx::query("INSERT INTO invoices (id, issued_at, user_id, total_amount) VALUES ($1, $2, $3, 0)")
        .bind(id)
        .bind(issued_at)
        .bind(event.user_id)
        .execute(conn)
        .await
        .map_err(LedgerError::classify)?;
    Ok(id)
}

async fn insert_movement(
    conn: &mut PgConnection,
    event: &MovementEvent,
    lot_id: Option<Uuid>,
    unit_price: Option<f64>,
) -> Result<Uuid, LedgerError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO stock_movements (id, product_id, lot_id, direction, quantity, unit_price, device_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(id)
    .bind(event.product_id)
    .bind(lot_id)
    .bind(event.direction.as_str())
    .bind(event.quantity)
    .bind(unit_price)
    .bind(event.device_id.as_deref())
    .execute(conn)
    .await
    .map_err(LedgerError::classify)?;
    Ok(id)
}

/// Sale price fallback for OUT movements that arrive without one.
pub(crate) fn resolve_unit_price(explicit: Option<f64>, sale_price: Option<f64>) -> f64 {
    explicit.or(sale_price).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn direction_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Direction::In).unwrap(), "\"IN\"");
        assert_eq!(serde_json::to_string(&Direction::Out).unwrap(), "\"OUT\"");
        let d: Direction = serde_json::from_str("\"OUT\"").unwrap();
        assert_eq!(d, Direction::Out);
        assert!(serde_json::from_str::<Direction>("\"SIDEWAYS\"").is_err());
    }

    #[test]
    fn unit_price_prefers_explicit_then_sale_price() {
        assert_eq!(resolve_unit_price(Some(9.5), Some(12.0)), 9.5);
        assert_eq!(resolve_unit_price(None, Some(12.0)), 12.0);
        assert_eq!(resolve_unit_price(None, None), 0.0);
    }

    #[test]
    fn error_messages_are_client_facing() {
        let err = LedgerError::InsufficientStock {
            product_id: Uuid::new_v4(),
            current: 4.0,
            requested: 7.0,
        };
        assert_eq!(err.to_string(), "Insufficient stock.");
        assert_eq!(err.code(), "insufficient_stock");

        let err = LedgerError::LotProductMismatch {
            lot_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
        };
        assert_eq!(err.to_string(), "Lot does not match product.");

        let err = LedgerError::InsufficientLotQuantity {
            lot_id: Uuid::new_v4(),
            remaining: 1.0,
            requested: 2.0,
        };
        assert_eq!(err.to_string(), "Insufficient lot quantity.");
    }

    #[test]
    fn ledger_errors_map_to_http_statuses() {
        let cases: Vec<(LedgerError, StatusCode)> = vec![
            (LedgerError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (LedgerError::ProductNotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (LedgerError::LotNotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (
                LedgerError::InsufficientStock {
                    product_id: Uuid::new_v4(),
                    current: 0.0,
                    requested: 1.0,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (LedgerError::LockTimeout, StatusCode::UNPROCESSABLE_ENTITY),
        ];
        for (err, expected) in cases {
            let resp = ApiError::from(err).into_response();
            assert_eq!(resp.status(), expected);
        }
    }
}
