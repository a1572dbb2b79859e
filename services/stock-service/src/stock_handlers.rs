//! Single-shot stock endpoints: same applier as the sync path, wrapped in a
//! plain transaction so an online client can move stock without batching.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

use common_http_errors::{ApiError, ApiResult};

use crate::ledger;
use crate::movement::{apply_movement, Direction, MovementEvent};
use crate::realtime::PublishMeta;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct StockInRequest {
    pub product_id: Uuid,
    pub quantity: Option<f64>,
    pub qty: Option<f64>,
    pub lot_id: Option<Uuid>,
    pub expiry_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    pub warranty: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StockOutRequest {
    pub product_id: Uuid,
    pub quantity: Option<f64>,
    pub qty: Option<f64>,
    pub lot_id: Option<Uuid>,
    pub unit_price: Option<f64>,
    pub invoice_id: Option<Uuid>,
    pub issued_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    pub device_id: Option<String>,
}

/// POST /stock-in
pub async fn stock_in(
    State(state): State<AppState>,
    Json(req): Json<StockInRequest>,
) -> ApiResult<Json<Value>> {
    let quantity = req.quantity.or(req.qty).unwrap_or(0.0);
    if !(quantity > 0.0) {
        return Err(ApiError::bad_request("invalid_quantity", "quantity must be positive"));
    }
    let event = MovementEvent {
        direction: Direction::In,
        product_id: req.product_id,
        quantity,
        lot_id: req.lot_id,
        expiry_date: req.expiry_date,
        supplier_id: req.supplier_id,
        warranty: req.warranty,
        unit_price: None,
        invoice_id: None,
        issued_at: None,
        user_id: None,
        device_id: req.device_id,
    };
    apply_single(state, event, "stock-in").await
}

/// POST /stock-out
pub async fn stock_out(
    State(state): State<AppState>,
    Json(req): Json<StockOutRequest>,
) -> ApiResult<Json<Value>> {
    let quantity = req.quantity.or(req.qty).unwrap_or(0.0);
    if !(quantity > 0.0) {
        return Err(ApiError::bad_request("invalid_quantity", "quantity must be positive"));
    }
    let event = MovementEvent {
        direction: Direction::Out,
        product_id: req.product_id,
        quantity,
        lot_id: req.lot_id,
        expiry_date: None,
        supplier_id: None,
        warranty: None,
        unit_price: req.unit_price,
        invoice_id: req.invoice_id,
        issued_at: req.issued_at,
        user_id: req.user_id,
        device_id: req.device_id,
    };
    apply_single(state, event, "stock-out").await
}

async fn apply_single(
    state: AppState,
    event: MovementEvent,
    source: &'static str,
) -> ApiResult<Json<Value>> {
    let mut tx = state.db.begin().await.map_err(|e| ApiError::internal(e, None))?;
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", state.lock_timeout_ms))
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let applied = apply_movement(&mut tx, &event).await.map_err(ApiError::from)?;
    let product = fetch_product_with_stock(&mut tx, event.product_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    let lot = match applied.lot_id {
        Some(lot_id) => fetch_lot(&mut tx, lot_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?,
        None => None,
    };
    let invoice = match applied.invoice_id {
        Some(invoice_id) => fetch_invoice(&mut tx, invoice_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?,
        None => None,
    };
    tx.commit().await.map_err(|e| ApiError::internal(e, None))?;

    state
        .metrics
        .movement_events_applied_total
        .with_label_values(&[event.direction.as_str()])
        .inc();

    if state.realtime.is_enabled() {
        let publisher = state.realtime.clone();
        let metrics = state.metrics.clone();
        let product_ids = vec![event.product_id];
        let meta = PublishMeta {
            sync_id: None,
            device_id: event.device_id.clone(),
            user_id: event.user_id,
            source,
        };
        tokio::spawn(async move {
            if let Err(err) = publisher.stock_changed(&product_ids, &meta).await {
                metrics.realtime_publish_failures.inc();
                tracing::warn!(error = %err, "realtime publish failed");
            }
        });
    }

    let movement = json!({
        "id": applied.movement_id,
        "product_id": event.product_id,
        "lot_id": applied.lot_id,
        "direction": event.direction,
        "quantity": event.quantity,
    });
    let mut body = json!({
        "success": true,
        "product": product,
    });
    match event.direction {
        Direction::In => {
            body["stock_in"] = movement;
            if let Some(lot) = lot {
                body["lot"] = lot;
            }
        }
        Direction::Out => {
            body["invoice_item"] = json!({
                "id": applied.invoice_item_id,
                "invoice_id": applied.invoice_id,
                "movement": movement,
            });
            if let Some(invoice) = invoice {
                body["invoice"] = invoice;
            }
            if let Some(lot) = lot {
                body["lot"] = lot;
            }
        }
    }
    Ok(Json(body))
}

/// GET /products/:id/stock returns both views: the materialized counter and the
/// ledger aggregation it must agree with.
pub async fn get_product_stock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let counter: Option<f64> = sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    let Some(counter) = counter else {
        return Err(ApiError::not_found("product_not_found"));
    };
    let ledger_stock = ledger::compute_stock(&state.db, id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(Json(json!({
        "product_id": id,
        "stock": counter,
        "ledger_stock": ledger_stock,
    })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MovementRecord {
    pub id: Uuid,
    pub product_id: Uuid,
    pub lot_id: Option<Uuid>,
    pub direction: String,
    pub quantity: f64,
    pub unit_price: Option<f64>,
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// GET /products/:id/movements, newest first.
pub async fn list_product_movements(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<MovementRecord>>> {
    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM products WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    if exists.is_none() {
        return Err(ApiError::not_found("product_not_found"));
    }
    let rows: Vec<MovementRecord> = sqlx::query_as(
        "SELECT id, product_id, lot_id, direction, quantity, unit_price, device_id, created_at \
         FROM stock_movements WHERE product_id = $1 ORDER BY created_at DESC, id",
    )
    .bind(id)
    .fetch_all(&state.db)
    .await
    .map_err(|e| ApiError::internal(e, None))?;
    Ok(Json(rows))
}

async fn fetch_product_with_stock(
    conn: &mut PgConnection,
    product_id: Uuid,
) -> Result<Value, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Detail {
        id: Uuid,
        product_code: Option<String>,
        name: Option<String>,
        standard_cost: Option<f64>,
        sale_price: Option<f64>,
        stock: f64,
    }
    let detail: Detail = sqlx::query_as(
        "SELECT id, product_code, name, standard_cost, sale_price, stock FROM products WHERE id = $1",
    )
    .bind(product_id)
    .fetch_one(&mut *conn)
    .await?;
    let ledger_stock = ledger::compute_stock(&mut *conn, product_id).await?;
    Ok(json!({
        "id": detail.id,
        "product_code": detail.product_code,
        "name": detail.name,
        "standard_cost": detail.standard_cost,
        "sale_price": detail.sale_price,
        "stock": detail.stock,
        "ledger_stock": ledger_stock,
    }))
}

async fn fetch_lot(conn: &mut PgConnection, lot_id: Uuid) -> Result<Option<Value>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Lot {
        id: Uuid,
        product_id: Uuid,
        expiry_date: Option<NaiveDate>,
        supplier_id: Option<Uuid>,
        warranty: Option<String>,
        remaining_qty: f64,
    }
    let lot: Option<Lot> = sqlx::query_as(
        "SELECT id, product_id, expiry_date, supplier_id, warranty, remaining_qty FROM lots WHERE id = $1",
    )
    .bind(lot_id)
    .fetch_optional(conn)
    .await?;
    Ok(lot.map(|l| {
        json!({
            "id": l.id,
            "product_id": l.product_id,
            "expiry_date": l.expiry_date,
            "supplier_id": l.supplier_id,
            "warranty": l.warranty,
            "remaining_qty": l.remaining_qty,
        })
    }))
}

async fn fetch_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Option<Value>, sqlx::Error> {
    #[derive(sqlx::FromRow)]
    struct Invoice {
        id: Uuid,
        issued_at: DateTime<Utc>,
        user_id: Option<Uuid>,
        total_amount: f64,
    }
    let invoice: Option<Invoice> = sqlx::query_as(
        "SELECT id, issued_at, user_id, total_amount FROM invoices WHERE id = $1",
    )
    .bind(invoice_id)
    .fetch_optional(conn)
    .await?;
    Ok(invoice.map(|i| {
        json!({
            "id": i.id,
            "issued_at": i.issued_at.to_rfc3339(),
            "user_id": i.user_id,
            "total_amount": i.total_amount,
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_in_request_accepts_legacy_qty() {
        let req: StockInRequest = serde_json::from_value(json!({
            "product_id": Uuid::new_v4(),
            "qty": 3,
        }))
        .unwrap();
        assert_eq!(req.quantity.or(req.qty), Some(3.0));
    }

    #[test]
    fn zero_and_negative_quantities_are_invalid() {
        for q in [0.0, -1.0, f64::NAN] {
            assert!(!(q > 0.0), "{q} must be rejected");
        }
    }
}
