//! Database layer: migrations, ledger records, the event log and the
//! reconciliation queue.

use std::str::FromStr;

use milestone_escrow::{LedgerError, LedgerEvent, LedgerRecord, ProjectId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::errors::{ApiError, Result};
use crate::events::{EventRecord, NewEvent};
use crate::settlement::ReconciliationRecord;
use crate::transfer::TransferRequest;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Each connection to `:memory:` is a separate database.
    let max_connections = if url.contains(":memory:") { 1 } else { 5 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Ledger ids as SQLite integers. Ids past `i64::MAX` are refused rather
/// than wrapped into negative keys.
pub(crate) fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| LedgerError::ArithmeticOverflow("record id").into())
}

// ─────────────────────────────────────────────────────────
// Ledger state
// ─────────────────────────────────────────────────────────

/// Persist the outcome of one ledger operation: upsert the records it touched
/// and append the events it emitted, in a single transaction.
pub async fn save_changes(
    pool: &SqlitePool,
    records: &[LedgerRecord],
    events: &[LedgerEvent],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    let updated_at = now();

    for record in records {
        let key = record.key();
        sqlx::query(
            r#"
            INSERT INTO ledger_records
                (record_key, kind, project_id, package_id, participant, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(record_key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.to_string())
        .bind(key.kind())
        .bind(sql_id(key.project_id())?)
        .bind(key.package_id().map(sql_id).transpose()?)
        .bind(key.participant().map(|who| who.to_string()))
        .bind(serde_json::to_string(record)?)
        .bind(updated_at)
        .execute(&mut *tx)
        .await?;
    }

    for event in events {
        let row = NewEvent::from_ledger(event)?;
        sqlx::query(
            r#"
            INSERT INTO events
                (event_type, project_id, package_id, actor, amount, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(row.event_type)
        .bind(row.project_id)
        .bind(row.package_id)
        .bind(&row.actor)
        .bind(&row.amount)
        .bind(&row.body)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(
        records = records.len(),
        events = events.len(),
        "Ledger changes persisted"
    );
    Ok(())
}

/// Load every persisted ledger record, for restoring state at startup.
pub async fn load_records(pool: &SqlitePool) -> Result<Vec<LedgerRecord>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT body FROM ledger_records ORDER BY project_id ASC, record_key ASC")
            .fetch_all(pool)
            .await?;
    rows.into_iter()
        .map(|(body,)| serde_json::from_str(&body).map_err(ApiError::from))
        .collect()
}

// ─────────────────────────────────────────────────────────
// Event reads
// ─────────────────────────────────────────────────────────

/// Fetch all events for a given project, in emission order.
pub async fn get_events_for_project(pool: &SqlitePool, project_id: ProjectId) -> Result<Vec<EventRecord>> {
    let project_id = sql_id(project_id)?;
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, project_id, package_id, actor, amount, body, created_at
        FROM   events
        WHERE  project_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch all events, in emission order.
pub async fn get_all_events(pool: &SqlitePool) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, event_type, project_id, package_id, actor, amount, body, created_at
        FROM   events
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Reconciliation queue
// ─────────────────────────────────────────────────────────

/// Queue a failed transfer for retry. Queuing the same reference again
/// reopens the row and counts another attempt.
pub async fn queue_reconciliation(
    pool: &SqlitePool,
    request: &TransferRequest,
    error: &str,
) -> Result<()> {
    let ts = now();
    sqlx::query(
        r#"
        INSERT INTO reconciliations
            (reference, payee, amount, request, last_error, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(reference) DO UPDATE SET
            request = excluded.request,
            last_error = excluded.last_error,
            attempts = attempts + 1,
            resolved = 0,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&request.reference)
    .bind(&request.payee)
    .bind(&request.amount)
    .bind(serde_json::to_string(request)?)
    .bind(error)
    .bind(ts)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn pending_reconciliations(pool: &SqlitePool) -> Result<Vec<ReconciliationRecord>> {
    let rows = sqlx::query_as::<_, ReconciliationRecord>(
        r#"
        SELECT id, reference, payee, amount, request, attempts, last_error, resolved,
               created_at, updated_at
        FROM   reconciliations
        WHERE  resolved = 0
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn all_reconciliations(pool: &SqlitePool) -> Result<Vec<ReconciliationRecord>> {
    let rows = sqlx::query_as::<_, ReconciliationRecord>(
        r#"
        SELECT id, reference, payee, amount, request, attempts, last_error, resolved,
               created_at, updated_at
        FROM   reconciliations
        ORDER  BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_reconciled(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE reconciliations SET resolved = 1, updated_at = ?2 WHERE id = ?1")
        .bind(id)
        .bind(now())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_reconcile_failure(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reconciliations
        SET    attempts = attempts + 1, last_error = ?2, updated_at = ?3
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use milestone_escrow::{PackageBudget, SharedLedger};

    use super::*;

    #[tokio::test]
    async fn saved_records_restore_the_ledger() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let ledger = SharedLedger::new();
        let (id, events, records) = ledger.create_project("USDC".into(), 1_000).unwrap();
        save_changes(&pool, &records, &events).await.unwrap();

        let ((), events) = ledger.with_project(id, |p| p.approve()).unwrap();
        let records = ledger.snapshot(id).unwrap().records_for(None, &[]);
        save_changes(&pool, &records, &events).await.unwrap();

        let restored = SharedLedger::restore(load_records(&pool).await.unwrap()).unwrap();
        assert_eq!(restored.snapshot(id).unwrap(), ledger.snapshot(id).unwrap());

        let stored = get_events_for_project(&pool, id).await.unwrap();
        let names: Vec<_> = stored.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(names, vec!["project_created", "project_approved"]);
        assert_eq!(stored[0].amount.as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn upsert_replaces_record_bodies() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let ledger = SharedLedger::new();
        let (id, _, records) = ledger.create_project("USDC".into(), 500).unwrap();
        save_changes(&pool, &records, &[]).await.unwrap();

        ledger
            .with_project(id, |p| {
                p.approve()?;
                p.start("factory".into())?;
                p.create_package(PackageBudget::new(100, 0, 0))
            })
            .unwrap();
        let snapshot = ledger.snapshot(id).unwrap();
        save_changes(&pool, &snapshot.records_for(Some(0), &[]), &[]).await.unwrap();
        save_changes(&pool, &snapshot.records_for(Some(0), &[]), &[]).await.unwrap();

        let records = load_records(&pool).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(get_all_events(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconciliation_queue_tracks_attempts() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let request = TransferRequest {
            reference: "0-0-mgp-alice".into(),
            payer: "escrow".into(),
            payee: "alice".into(),
            asset: "USDC".into(),
            amount: "150".into(),
        };
        queue_reconciliation(&pool, &request, "timeout").await.unwrap();
        queue_reconciliation(&pool, &request, "still down").await.unwrap();

        let pending = pending_reconciliations(&pool).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error, "still down");

        mark_reconciled(&pool, pending[0].id).await.unwrap();
        assert!(pending_reconciliations(&pool).await.unwrap().is_empty());
        assert!(all_reconciliations(&pool).await.unwrap()[0].resolved);
    }

    #[tokio::test]
    async fn ids_beyond_sqlite_range_are_refused() {
        assert_eq!(sql_id(i64::MAX as u64).unwrap(), i64::MAX);
        assert_eq!(sql_id(u64::MAX).unwrap_err().kind(), "arithmetic_overflow");

        let pool = init_pool("sqlite::memory:").await.unwrap();
        let err = get_events_for_project(&pool, u64::MAX).await.unwrap_err();
        assert_eq!(err.kind(), "arithmetic_overflow");
    }
}
