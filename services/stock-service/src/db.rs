use sqlx::PgPool;

/// Idempotent schema bootstrap; mirrors the production migrations so tests
/// and fresh deployments can start against an empty database.
pub(crate) const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS products (
        id uuid PRIMARY KEY,
        product_code text,
        name text,
        standard_cost double precision,
        sale_price double precision,
        stock double precision NOT NULL DEFAULT 0,
        created_at timestamptz NOT NULL DEFAULT NOW(),
        updated_at timestamptz NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS lots (
        id uuid PRIMARY KEY,
        product_id uuid NOT NULL,
        expiry_date date,
        supplier_id uuid,
        warranty text,
        remaining_qty double precision NOT NULL DEFAULT 0,
        created_at timestamptz NOT NULL DEFAULT NOW(),
        updated_at timestamptz NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_lots_product ON lots (product_id)",
    "CREATE TABLE IF NOT EXISTS stock_movements (
        id uuid PRIMARY KEY,
        product_id uuid NOT NULL,
        lot_id uuid,
        direction text NOT NULL CHECK (direction IN ('IN', 'OUT')),
        quantity double precision NOT NULL,
        unit_price double precision,
        device_id text,
        created_at timestamptz NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_stock_movements_product ON stock_movements (product_id, created_at)",
    "CREATE TABLE IF NOT EXISTS invoices (
        id uuid PRIMARY KEY,
        issued_at timestamptz NOT NULL,
        user_id uuid,
        total_amount double precision NOT NULL DEFAULT 0,
        created_at timestamptz NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS invoice_items (
        id uuid PRIMARY KEY,
        invoice_id uuid NOT NULL,
        product_id uuid NOT NULL,
        quantity double precision NOT NULL,
        unit_price double precision NOT NULL,
        created_at timestamptz NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_invoice_items_invoice ON invoice_items (invoice_id)",
    "CREATE TABLE IF NOT EXISTS sync_batches (
        id uuid PRIMARY KEY,
        sync_id uuid NOT NULL UNIQUE,
        user_id uuid,
        device_id text,
        status text NOT NULL,
        request_json jsonb NOT NULL,
        response_json jsonb NOT NULL,
        created_at timestamptz NOT NULL DEFAULT NOW()
    )",
];

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for stmt in SCHEMA_STATEMENTS {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_are_idempotent() {
        for stmt in SCHEMA_STATEMENTS {
            assert!(
                stmt.trim_start().starts_with("CREATE TABLE IF NOT EXISTS")
                    || stmt.trim_start().starts_with("CREATE INDEX IF NOT EXISTS"),
                "statement must be re-runnable: {stmt}"
            );
        }
    }

    #[test]
    fn movement_direction_is_constrained() {
        let movements = SCHEMA_STATEMENTS
            .iter()
            .find(|s| s.contains("stock_movements ("))
            .expect("stock_movements table");
        assert!(movements.contains("CHECK (direction IN ('IN', 'OUT'))"));
    }
}
