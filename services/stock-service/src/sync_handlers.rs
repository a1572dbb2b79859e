//! Offline sync: a device uploads a batch of queued movements and gets back a
//! per-event verdict plus (optionally) a fresh stock snapshot. Batches are
//! idempotent by `sync_id`: replays are answered verbatim from the stored
//! response without touching the ledger.

use std::collections::{HashMap, HashSet};

use axum::{extract::State, Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::{Acquire, PgConnection, PgPool};
use uuid::Uuid;

use common_http_errors::{ApiError, ApiResult};
use common_observability::LedgerMetrics;

use crate::ledger;
use crate::movement::{apply_movement, Direction, MovementEvent};
use crate::realtime::PublishMeta;
use crate::AppState;

pub(crate) const STORED_RESPONSE_SQL: &str =
    "SELECT response_json FROM sync_batches WHERE sync_id = $1";

/// Generic movement entry from the client's offline queue.
#[derive(Debug, Deserialize)]
pub struct MovementInput {
    #[serde(rename = "type")]
    pub kind: Direction,
    pub product_id: Uuid,
    pub quantity: Option<f64>,
    /// Legacy field name still sent by older clients.
    pub qty: Option<f64>,
    pub lot_id: Option<Uuid>,
    pub expiry_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    pub warranty: Option<String>,
    pub unit_price: Option<f64>,
    pub invoice_id: Option<Uuid>,
    pub issued_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct StockInInput {
    pub product_id: Uuid,
    pub quantity: Option<f64>,
    pub qty: Option<f64>,
    pub lot_id: Option<Uuid>,
    pub expiry_date: Option<NaiveDate>,
    pub supplier_id: Option<Uuid>,
    pub warranty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceItemInput {
    pub product_id: Uuid,
    pub quantity: Option<f64>,
    pub qty: Option<f64>,
    pub unit_price: Option<f64>,
    pub lot_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub issued_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

/// Key under which snapshot entries are grouped in the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockKey {
    #[default]
    Id,
    Barcode,
    Name,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequest {
    pub sync_id: Option<Uuid>,
    pub device_id: Option<String>,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub movements: Vec<MovementInput>,
    #[serde(default)]
    pub stock_ins: Vec<StockInInput>,
    #[serde(default)]
    pub invoice_items: Vec<InvoiceItemInput>,
    #[serde(default)]
    pub include_stock: bool,
    pub stock_key: Option<StockKey>,
}

#[derive(Debug, Serialize)]
pub struct EventError {
    pub index: usize,
    #[serde(rename = "type")]
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct AppliedCounts {
    pub stock_ins: usize,
    pub stock_outs: usize,
}

#[derive(Debug, Serialize)]
pub struct CreatedIds {
    pub stock_in_ids: Vec<Uuid>,
    pub invoice_ids: Vec<Uuid>,
    pub invoice_item_ids: Vec<Uuid>,
    pub lot_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<Uuid>,
    pub server_time: String,
    pub applied: AppliedCounts,
    pub created: CreatedIds,
    pub errors: Vec<EventError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<Map<String, Value>>,
}

pub struct BatchOutcome {
    pub response: Value,
    pub product_ids: Vec<Uuid>,
    pub had_errors: bool,
}

/// POST /sync
pub async fn submit_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Json<Value>> {
    let events = normalize_events(&req);
    if events.is_empty() {
        return Err(ApiError::unprocessable("empty_sync", "Sync batch contains no events."));
    }

    // Replay check before any work: a known sync_id gets the stored response
    // byte for byte.
    if let Some(sync_id) = req.sync_id {
        if let Some(stored) = find_stored_response(&state.db, sync_id)
            .await
            .map_err(|e| ApiError::internal(e, None))?
        {
            state.metrics.sync_batch_replays_total.inc();
            tracing::info!(sync_id = %sync_id, "replayed sync batch from stored response");
            return Ok(Json(stored));
        }
    }

    let timer = state.metrics.sync_batch_duration_seconds.start_timer();
    let outcome =
        run_sync_batch(&state.db, state.lock_timeout_ms, &state.metrics, &req, &events).await?;
    timer.observe_duration();
    state.metrics.sync_batches_total.inc();

    // Post-commit, fire-and-forget. The response does not wait on it.
    if outcome.had_product_changes() && state.realtime.is_enabled() {
        let publisher = state.realtime.clone();
        let metrics = state.metrics.clone();
        let product_ids = outcome.product_ids.clone();
        let meta = PublishMeta {
            sync_id: req.sync_id,
            device_id: req.device_id.clone(),
            user_id: req.user_id,
            source: "sync",
        };
        tokio::spawn(async move {
            if let Err(err) = publisher.stock_changed(&product_ids, &meta).await {
                metrics.realtime_publish_failures.inc();
                tracing::warn!(error = %err, "realtime publish failed");
            }
        });
    }

    Ok(Json(outcome.response))
}

impl BatchOutcome {
    fn had_product_changes(&self) -> bool {
        !self.product_ids.is_empty()
    }
}

/// Flattens the three request shapes into one ordered event list:
/// `movements` first, then `stock_ins` (IN), then `invoice_items` (OUT).
pub fn normalize_events(req: &SyncRequest) -> Vec<MovementEvent> {
    let total = req.movements.len() + req.stock_ins.len() + req.invoice_items.len();
    let mut events = Vec::with_capacity(total);
    for m in &req.movements {
        events.push(MovementEvent {
            direction: m.kind,
            product_id: m.product_id,
            quantity: m.quantity.or(m.qty).unwrap_or(0.0),
            lot_id: m.lot_id,
            expiry_date: m.expiry_date,
            supplier_id: m.supplier_id,
            warranty: m.warranty.clone(),
            unit_price: m.unit_price,
            invoice_id: m.invoice_id,
            issued_at: m.issued_at,
            user_id: m.user_id.or(req.user_id),
            device_id: req.device_id.clone(),
        });
    }
    for s in &req.stock_ins {
        events.push(MovementEvent {
            direction: Direction::In,
            product_id: s.product_id,
            quantity: s.quantity.or(s.qty).unwrap_or(0.0),
            lot_id: s.lot_id,
            expiry_date: s.expiry_date,
            supplier_id: s.supplier_id,
            warranty: s.warranty.clone(),
            unit_price: None,
            invoice_id: None,
            issued_at: None,
            user_id: req.user_id,
            device_id: req.device_id.clone(),
        });
    }
    for it in &req.invoice_items {
        events.push(MovementEvent {
            direction: Direction::Out,
            product_id: it.product_id,
            quantity: it.quantity.or(it.qty).unwrap_or(0.0),
            lot_id: it.lot_id,
            expiry_date: None,
            supplier_id: None,
            warranty: None,
            unit_price: it.unit_price,
            invoice_id: it.invoice_id,
            issued_at: it.issued_at,
            user_id: it.user_id.or(req.user_id),
            device_id: req.device_id.clone(),
        });
    }
    events
}

/// Runs the batch inside one transaction with a savepoint per event, then
/// stores the response under the sync_id and commits. Exposed for tests.
pub async fn run_sync_batch(
    db: &PgPool,
    lock_timeout_ms: i64,
    metrics: &LedgerMetrics,
    req: &SyncRequest,
    events: &[MovementEvent],
) -> Result<BatchOutcome, ApiError> {
    let mut tx = db.begin().await.map_err(|e| ApiError::internal(e, None))?;

    // SET LOCAL via set_config so the timeout dies with the transaction.
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{lock_timeout_ms}ms"))
        .execute(&mut *tx)
        .await
        .map_err(|e| ApiError::internal(e, None))?;

    let mut applied_in = 0usize;
    let mut applied_out = 0usize;
    let mut stock_in_ids = Vec::new();
    let mut invoice_ids = Vec::new();
    let mut invoice_item_ids = Vec::new();
    let mut lot_ids = Vec::new();
    let mut errors = Vec::new();

    for (index, event) in events.iter().enumerate() {
        let applied = {
            let mut sp = tx.begin().await.map_err(|e| ApiError::internal(e, None))?;
            match apply_movement(&mut sp, event).await {
                Ok(applied) => {
                    sp.commit().await.map_err(|e| ApiError::internal(e, None))?;
                    Ok(applied)
                }
                Err(err) => {
                    // Releases the savepoint; earlier events stay applied.
                    if let Err(rb) = sp.rollback().await {
                        tracing::warn!(error = %rb, index, "savepoint rollback failed");
                    }
                    Err(err)
                }
            }
        };
        match applied {
            Ok(applied) => match event.direction {
                Direction::In => {
                    applied_in += 1;
                    stock_in_ids.push(applied.movement_id);
                    if let Some(lot) = applied.lot_id {
                        lot_ids.push(lot);
                    }
                    metrics.movement_events_applied_total.with_label_values(&["IN"]).inc();
                }
                Direction::Out => {
                    applied_out += 1;
                    if let Some(id) = applied.invoice_id {
                        invoice_ids.push(id);
                    }
                    if let Some(id) = applied.invoice_item_id {
                        invoice_item_ids.push(id);
                    }
                    metrics.movement_events_applied_total.with_label_values(&["OUT"]).inc();
                }
            },
            Err(err) => {
                tracing::warn!(
                    index,
                    product_id = %event.product_id,
                    error = %err,
                    "sync event rejected"
                );
                metrics.movement_events_failed_total.with_label_values(&[err.code()]).inc();
                errors.push(EventError {
                    index,
                    direction: event.direction,
                    product_id: Some(event.product_id),
                    message: err.to_string(),
                });
            }
        }
    }

    let stock = if req.include_stock {
        let snapshot =
            build_stock_snapshot(&mut tx, events, req.stock_key.unwrap_or_default())
                .await
                .map_err(|e| ApiError::internal(e, None))?;
        Some(snapshot)
    } else {
        None
    };

    let response = SyncResponse {
        status: "ok",
        sync_id: req.sync_id,
        server_time: Utc::now().to_rfc3339(),
        applied: AppliedCounts { stock_ins: applied_in, stock_outs: applied_out },
        created: CreatedIds {
            stock_in_ids,
            invoice_ids: dedup_preserving(invoice_ids),
            invoice_item_ids,
            lot_ids: dedup_preserving(lot_ids),
        },
        errors,
        stock,
    };
    let had_errors = !response.errors.is_empty();
    let response_value =
        serde_json::to_value(&response).map_err(|e| ApiError::internal(e, None))?;

    if let Some(sync_id) = req.sync_id {
        let status = if had_errors { "applied_with_errors" } else { "applied" };
        let request_json =
            serde_json::to_value(events).map_err(|e| ApiError::internal(e, None))?;
        let inserted = sqlx::query(
            "INSERT INTO sync_batches (id, sync_id, user_id, device_id, status, request_json, response_json) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(sync_id)
        .bind(req.user_id)
        .bind(req.device_id.as_deref())
        .bind(status)
        .bind(&request_json)
        .bind(&response_value)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                // A concurrent submission with the same sync_id committed
                // first. Drop this batch's work and answer with the winner's
                // stored response, same as a replay.
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, sync_id = %sync_id, "rollback after duplicate sync_id failed");
                }
                let stored = find_stored_response(db, sync_id)
                    .await
                    .map_err(|e| ApiError::internal(e, None))?;
                let Some(stored) = stored else {
                    return Err(ApiError::internal(err, None));
                };
                metrics.sync_batch_replays_total.inc();
                tracing::info!(sync_id = %sync_id, "lost duplicate sync_id race; replayed stored response");
                return Ok(BatchOutcome {
                    response: stored,
                    product_ids: Vec::new(),
                    had_errors: false,
                });
            }
            Err(err) => return Err(ApiError::internal(err, None)),
        }
    }

    tx.commit().await.map_err(|e| ApiError::internal(e, None))?;

    Ok(BatchOutcome {
        response: response_value,
        product_ids: distinct_product_ids(events),
        had_errors,
    })
}

pub async fn find_stored_response(
    db: &PgPool,
    sync_id: Uuid,
) -> Result<Option<Value>, sqlx::Error> {
    sqlx::query_scalar::<_, Value>(STORED_RESPONSE_SQL)
        .bind(sync_id)
        .fetch_optional(db)
        .await
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotProduct {
    id: Uuid,
    name: Option<String>,
    product_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Snapshot of every product touched by the batch, read inside the batch
/// transaction so it reflects exactly the post-batch ledger.
async fn build_stock_snapshot(
    conn: &mut PgConnection,
    events: &[MovementEvent],
    key: StockKey,
) -> Result<Map<String, Value>, sqlx::Error> {
    let product_ids = distinct_product_ids(events);
    if product_ids.is_empty() {
        return Ok(Map::new());
    }
    let rows: Vec<SnapshotProduct> = sqlx::query_as(
        "SELECT id, name, product_code, created_at, updated_at FROM products WHERE id = ANY($1)",
    )
    .bind(&product_ids)
    .fetch_all(&mut *conn)
    .await?;
    let stock_map = ledger::compute_stock_map(&mut *conn, &product_ids).await?;
    Ok(snapshot_entries(rows, &stock_map, key))
}

/// Keys each product under the requested field, falling back to the id when
/// the field is empty and suffixing `#<id>` on collisions.
fn snapshot_entries(
    rows: Vec<SnapshotProduct>,
    stock_map: &HashMap<Uuid, f64>,
    key: StockKey,
) -> Map<String, Value> {
    let mut out = Map::new();
    for p in rows {
        let quantity = stock_map.get(&p.id).copied().unwrap_or(0.0);
        let base_key = match key {
            StockKey::Id => p.id.to_string(),
            StockKey::Barcode => p
                .product_code
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| p.id.to_string()),
            StockKey::Name => p
                .name
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| p.id.to_string()),
        };
        let entry_key = if out.contains_key(&base_key) {
            format!("{base_key}#{}", p.id)
        } else {
            base_key
        };
        out.insert(
            entry_key,
            json!({
                "id": p.id,
                "name": p.name,
                "product_code": p.product_code,
                "barcode": p.product_code,
                "quantity": quantity,
                "created_at": p.created_at.to_rfc3339(),
                "updated_at": p.updated_at.to_rfc3339(),
            }),
        );
    }
    out
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn dedup_preserving(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn distinct_product_ids(events: &[MovementEvent]) -> Vec<Uuid> {
    dedup_preserving(events.iter().map(|e| e.product_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with(movements: Vec<MovementInput>) -> SyncRequest {
        SyncRequest { movements, ..Default::default() }
    }

    fn movement_json(v: Value) -> MovementInput {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn normalization_orders_movements_then_ins_then_outs() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let p3 = Uuid::new_v4();
        let req: SyncRequest = serde_json::from_value(json!({
            "movements": [{"type": "OUT", "product_id": p1, "quantity": 2}],
            "stock_ins": [{"product_id": p2, "quantity": 5}],
            "invoice_items": [{"product_id": p3, "qty": 1, "unit_price": 3.5}],
        }))
        .unwrap();
        let events = normalize_events(&req);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].direction, Direction::Out);
        assert_eq!(events[0].product_id, p1);
        assert_eq!(events[1].direction, Direction::In);
        assert_eq!(events[1].product_id, p2);
        assert_eq!(events[2].direction, Direction::Out);
        assert_eq!(events[2].product_id, p3);
        assert_eq!(events[2].quantity, 1.0);
        assert_eq!(events[2].unit_price, Some(3.5));
    }

    #[test]
    fn quantity_falls_back_to_legacy_qty() {
        let pid = Uuid::new_v4();
        let req = req_with(vec![movement_json(json!({
            "type": "IN", "product_id": pid, "qty": 4.5
        }))]);
        let events = normalize_events(&req);
        assert_eq!(events[0].quantity, 4.5);

        // quantity wins when both are present
        let req = req_with(vec![movement_json(json!({
            "type": "IN", "product_id": pid, "quantity": 7, "qty": 4.5
        }))]);
        assert_eq!(normalize_events(&req)[0].quantity, 7.0);

        // neither present normalizes to zero; the applier rejects it
        let req = req_with(vec![movement_json(json!({
            "type": "IN", "product_id": pid
        }))]);
        assert_eq!(normalize_events(&req)[0].quantity, 0.0);
    }

    #[test]
    fn batch_user_and_device_flow_into_events() {
        let pid = Uuid::new_v4();
        let user = Uuid::new_v4();
        let req: SyncRequest = serde_json::from_value(json!({
            "user_id": user,
            "device_id": "pos-7",
            "invoice_items": [{"product_id": pid, "quantity": 1}],
        }))
        .unwrap();
        let events = normalize_events(&req);
        assert_eq!(events[0].user_id, Some(user));
        assert_eq!(events[0].device_id.as_deref(), Some("pos-7"));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(dedup_preserving(vec![a, b, a, b, a]), vec![a, b]);
    }

    #[test]
    fn snapshot_falls_back_and_suffixes_collisions() {
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let id3 = Uuid::new_v4();
        let now = Utc::now();
        let rows = vec![
            SnapshotProduct {
                id: id1,
                name: Some("Cola".into()),
                product_code: Some("111".into()),
                created_at: now,
                updated_at: now,
            },
            SnapshotProduct {
                id: id2,
                name: Some("Cola".into()),
                product_code: Some("222".into()),
                created_at: now,
                updated_at: now,
            },
            SnapshotProduct {
                id: id3,
                name: None,
                product_code: None,
                created_at: now,
                updated_at: now,
            },
        ];
        let mut stock = HashMap::new();
        stock.insert(id1, 6.0);

        let by_name = snapshot_entries(rows, &stock, StockKey::Name);
        assert!(by_name.contains_key("Cola"));
        assert!(by_name.contains_key(&format!("Cola#{id2}")));
        // missing name keys under the id
        assert!(by_name.contains_key(&id3.to_string()));
        assert_eq!(by_name["Cola"]["quantity"], json!(6.0));
        // products absent from the ledger aggregation read as zero
        assert_eq!(by_name[&id3.to_string()]["quantity"], json!(0.0));
    }

    #[test]
    fn stock_key_parses_snake_case() {
        let req: SyncRequest = serde_json::from_value(json!({
            "stock_key": "barcode",
            "include_stock": true,
        }))
        .unwrap();
        assert_eq!(req.stock_key, Some(StockKey::Barcode));
        assert_eq!(StockKey::default(), StockKey::Id);
    }

    #[test]
    fn unknown_movement_type_is_rejected_at_parse_time() {
        let res: Result<SyncRequest, _> = serde_json::from_value(json!({
            "movements": [{"type": "TRANSFER", "product_id": Uuid::new_v4(), "quantity": 1}],
        }));
        assert!(res.is_err());
    }
}
