//! PostgreSQL schema bootstrap for the engine's logical tables.
//!
//! Numeric columns are `NUMERIC` (arbitrary precision) so ledger arithmetic
//! survives the round-trip without float drift. `idempotency_key` is UNIQUE;
//! Postgres permits any number of NULLs there, which is exactly the
//! unique-when-set contract.

use sqlx::PgPool;

use crate::error::EngineResult;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS positions (
        id              UUID PRIMARY KEY,
        account_id      TEXT NOT NULL,
        symbol          TEXT NOT NULL,
        side            TEXT NOT NULL,
        size            NUMERIC NOT NULL,
        avg_entry_price NUMERIC NOT NULL,
        leverage        NUMERIC NOT NULL,
        margin_used     NUMERIC NOT NULL,
        unrealized_pnl  NUMERIC NOT NULL,
        realized_pnl    NUMERIC NOT NULL,
        status          TEXT NOT NULL,
        stop_loss       NUMERIC,
        take_profit     NUMERIC,
        close_reason    TEXT,
        opened_at       TIMESTAMPTZ NOT NULL,
        closed_at       TIMESTAMPTZ,
        created_at      TIMESTAMPTZ NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status)",
    "CREATE INDEX IF NOT EXISTS idx_positions_account ON positions (account_id)",
    r#"
    CREATE TABLE IF NOT EXISTS trade_executions (
        id              UUID PRIMARY KEY,
        position_id     UUID NOT NULL REFERENCES positions (id),
        order_id        TEXT NOT NULL,
        execution_type  TEXT NOT NULL,
        price           NUMERIC NOT NULL,
        size            NUMERIC NOT NULL,
        executed_at     TIMESTAMPTZ NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_executions_position ON trade_executions (position_id)",
    r#"
    CREATE TABLE IF NOT EXISTS position_events (
        id              BIGSERIAL PRIMARY KEY,
        position_id     UUID NOT NULL,
        event_type      TEXT NOT NULL,
        previous_status TEXT,
        new_status      TEXT,
        payload         JSONB NOT NULL,
        idempotency_key TEXT UNIQUE,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_position_time ON position_events (position_id, created_at, id)",
    r#"
    CREATE TABLE IF NOT EXISTS account_balances (
        account_id      TEXT PRIMARY KEY,
        equity          NUMERIC NOT NULL,
        balance         NUMERIC NOT NULL,
        margin_used     NUMERIC NOT NULL,
        free_margin     NUMERIC NOT NULL,
        leverage        NUMERIC NOT NULL,
        is_paper        BOOLEAN NOT NULL,
        updated_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS account_balance_events (
        id              BIGSERIAL PRIMARY KEY,
        account_id      TEXT NOT NULL,
        event_type      TEXT NOT NULL,
        balance_before  NUMERIC NOT NULL,
        amount          NUMERIC NOT NULL,
        balance_after   NUMERIC NOT NULL,
        reason          TEXT NOT NULL,
        position_id     UUID,
        execution_id    UUID,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_balance_events_account ON account_balance_events (account_id, id)",
    r#"
    CREATE TABLE IF NOT EXISTS transaction_log (
        id              BIGSERIAL PRIMARY KEY,
        tx_id           UUID NOT NULL,
        op_name         TEXT NOT NULL,
        status          TEXT NOT NULL,
        isolation_level TEXT NOT NULL,
        started_at      TIMESTAMPTZ NOT NULL,
        completed_at    TIMESTAMPTZ,
        duration_ms     BIGINT,
        error_message   TEXT,
        metadata        JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reconciliation_log (
        reconciliation_id   UUID PRIMARY KEY,
        positions_checked   INTEGER NOT NULL,
        discrepancies_found INTEGER NOT NULL,
        discrepancies       JSONB NOT NULL,
        actions_taken       JSONB NOT NULL,
        duration_ms         BIGINT NOT NULL,
        created_at          TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Create every engine table that does not exist yet
pub async fn init_schema(pool: &PgPool) -> EngineResult<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!(tables = DDL.len(), "schema bootstrap complete");
    Ok(())
}
