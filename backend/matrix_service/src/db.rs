//! Database layer: migrations, payout ledger and cycle audit log.

use matrix_engine::{CycleRecord, MatrixId, MemberId, PayoutInstruction, PayoutReason, RunId};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::{Result, ServiceError};
use crate::events::{CycleRow, PayoutRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    // Every in-memory connection is its own database, so keep exactly one.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Ledger writes
// ─────────────────────────────────────────────────────────

/// Open a new engine run. Every process start gets its own run id, which
/// scopes the payout keys and cycle ids of the engine built for it.
pub async fn start_run(pool: &SqlitePool) -> Result<RunId> {
    let id = sqlx::query("INSERT INTO engine_runs DEFAULT VALUES")
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(RunId(id as u64))
}

/// Record a payout instruction.
///
/// The idempotency key is unique in the ledger: a second write with the same
/// key changes nothing and returns [`ServiceError::PayoutIdempotencyViolation`].
pub async fn record_payout(
    pool: &SqlitePool,
    run: RunId,
    matrix_id: MatrixId,
    payout: &PayoutInstruction,
) -> Result<()> {
    let level = match payout.reason {
        PayoutReason::LevelFill { level } | PayoutReason::LevelCompletion { level } => {
            Some(level as i64)
        }
        PayoutReason::Referral | PayoutReason::CycleCompletion | PayoutReason::Matching => None,
    };

    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO payouts
            (idempotency_key, run_id, matrix_id, member_id, amount, currency, reason, level)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&payout.idempotency_key)
    .bind(run.0 as i64)
    .bind(matrix_id.0 as i64)
    .bind(payout.member.0 as i64)
    .bind(payout.amount.to_string())
    .bind(&payout.currency)
    .bind(payout.reason.as_str())
    .bind(level)
    .execute(pool)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(ServiceError::PayoutIdempotencyViolation(
            payout.idempotency_key.clone(),
        ));
    }
    Ok(())
}

/// Append a cycle to the audit log. Returns `false` if it was already there.
pub async fn insert_cycle_record(pool: &SqlitePool, record: &CycleRecord) -> Result<bool> {
    let participants = serde_json::to_string(&record.participants)?;
    let rows_affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO cycle_records
            (run_id, id, matrix_id, root_position, completer, participants,
             completion_bonus, completed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(record.run.0 as i64)
    .bind(record.id.0 as i64)
    .bind(record.matrix_id.0 as i64)
    .bind(record.root.0 as i64)
    .bind(record.completer.0 as i64)
    .bind(participants)
    .bind(record.completion_bonus.to_string())
    .bind(record.completed_at.timestamp())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

/// Fetch all payouts owed to a member, oldest first.
pub async fn get_payouts_for_member(
    pool: &SqlitePool,
    member: MemberId,
) -> Result<Vec<PayoutRecord>> {
    let rows = sqlx::query_as::<_, PayoutRecord>(
        r#"
        SELECT id, idempotency_key, run_id, matrix_id, member_id, amount,
               currency, reason, level, created_at
        FROM   payouts
        WHERE  member_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(member.0 as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch the cycle audit log of a matrix, in completion order.
pub async fn get_cycles_for_matrix(pool: &SqlitePool, matrix: MatrixId) -> Result<Vec<CycleRow>> {
    let rows = sqlx::query_as::<_, CycleRow>(
        r#"
        SELECT run_id, id, matrix_id, root_position, completer, participants,
               completion_bonus, completed_at
        FROM   cycle_records
        WHERE  matrix_id = ?1
        ORDER  BY run_id ASC, id ASC
        "#,
    )
    .bind(matrix.0 as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
