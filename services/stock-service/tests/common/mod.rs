//! Shared helpers for integration tests that run against an ephemeral
//! Postgres (testcontainers). Gated behind ENABLE_ITESTS=1.

use sqlx::PgPool;
use uuid::Uuid;

pub async fn insert_product(pool: &PgPool, name: &str, sale_price: f64, stock: f64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO products (id, product_code, name, sale_price, stock) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(format!("code-{id}"))
    .bind(name)
    .bind(sale_price)
    .bind(stock)
    .execute(pool)
    .await
    .expect("insert product");
    id
}

pub async fn insert_lot(pool: &PgPool, product_id: Uuid, remaining_qty: f64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO lots (id, product_id, remaining_qty) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(product_id)
        .bind(remaining_qty)
        .execute(pool)
        .await
        .expect("insert lot");
    id
}

pub async fn insert_invoice(pool: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO invoices (id, issued_at, total_amount) VALUES ($1, NOW(), 0)")
        .bind(id)
        .execute(pool)
        .await
        .expect("insert invoice");
    id
}

pub async fn invoice_total(pool: &PgPool, invoice_id: Uuid) -> f64 {
    sqlx::query_scalar("SELECT total_amount FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .fetch_one(pool)
        .await
        .expect("read invoice total")
}

pub async fn invoice_lines_total(pool: &PgPool, invoice_id: Uuid) -> f64 {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(quantity * unit_price), 0)::float8 FROM invoice_items WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(pool)
    .await
    .expect("sum invoice lines")
}

pub async fn counter_stock(pool: &PgPool, product_id: Uuid) -> f64 {
    sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_one(pool)
        .await
        .expect("read counter")
}

pub async fn ledger_stock(pool: &PgPool, product_id: Uuid) -> f64 {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(CASE WHEN direction = 'IN' THEN quantity ELSE -quantity END), 0)::float8 \
         FROM stock_movements WHERE product_id = $1",
    )
    .bind(product_id)
    .fetch_one(pool)
    .await
    .expect("read ledger")
}

pub async fn lot_remaining(pool: &PgPool, lot_id: Uuid) -> f64 {
    sqlx::query_scalar("SELECT remaining_qty FROM lots WHERE id = $1")
        .bind(lot_id)
        .fetch_one(pool)
        .await
        .expect("read lot")
}
