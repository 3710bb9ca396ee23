//! Postgres-backed stores.
//!
//! ## Locking
//!
//! | operation | guard |
//! |-----------|-------|
//! | `apply`, `allocate` | `SELECT ... FOR UPDATE` on the `stocks` rows involved |
//! | `rebuild_snapshot` | `pg_advisory_xact_lock(hashtext('stock_snapshot:' || date))` |
//! | reservation transitions | `pg_advisory_xact_lock(hashtext(business key))` + `FOR UPDATE` |
//!
//! Advisory locks are transaction-scoped, so they are released on commit or
//! rollback and also serialise callers living in other processes.
//!
//! `apply` and `allocate` look up `(ref, ref_line)` again once the slot locks
//! are held. Under READ COMMITTED that read sees a duplicate committed while
//! we waited, so the loser returns a replay instead of hitting `23505`.
//!
//! ## Error mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | unique violation | `23505` | `Concurrency` |
//! | serialization failure / deadlock | `40001` / `40P01` | `Concurrency` |
//! | any other database error | other | `Storage` |
//! | pool closed, io, decode | n/a | `Storage` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use stockledger_core::{BatchKey, DomainError, ItemId, ReservationId, TraceId, WarehouseId};
use stockledger_inventory::{
    AllocationPlan, ApplyOutcome, Batch, ConsumeOutcome, FefoCandidate, KeyBalance, LedgerCut,
    LedgerEntry, Movement, MovementReason, NewReservation, PlanOptions, ReleaseOutcome, Reservation,
    ReservationKey, ReservationLine, ReservationStatus, SnapshotRow, SnapshotSummary, StockKey,
    StockSlot, apply_delta, plan, resolve_inbound_dates, snapshot_cutoff,
};

use super::{
    AllocationRequest, AllocationResult, CreatedReservation, LedgerStats, ReservationStore,
    StockStore, plan_from_legs, prior_allocation, required_batch_key,
};
use crate::error::{StoreError, StoreResult};

/// Schema applied by the worker at startup.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_inventory_core.sql");

/// Applies [`SCHEMA_SQL`]. Every statement is `IF NOT EXISTS`, so re-running is safe.
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
}

impl PostgresStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

const LEDGER_COLUMNS: &str = "id, warehouse_id, item_id, batch_code_key, delta, reason, ref, \
                              ref_line, after_qty, occurred_at, trace_id";

const BATCH_COLUMNS: &str =
    "id, item_id, warehouse_id, batch_code, production_date, expiry_date, created_at";

async fn find_ledger_entry(
    conn: &mut PgConnection,
    reference: &str,
    ref_line: i32,
) -> StoreResult<Option<LedgerEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {LEDGER_COLUMNS} FROM stock_ledger WHERE ref = $1 AND ref_line = $2"
    ))
    .bind(reference)
    .bind(ref_line)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_ledger_entry", e))?;
    row.as_ref().map(ledger_entry_from_row).transpose()
}

/// Prior allocation written under `request.reference`, returned as a replay.
async fn replay_allocation(
    conn: &mut PgConnection,
    request: &AllocationRequest,
) -> StoreResult<Option<AllocationResult>> {
    let rows = sqlx::query(&format!(
        "SELECT {LEDGER_COLUMNS} FROM stock_ledger WHERE ref = $1 ORDER BY ref_line"
    ))
    .bind(&request.reference)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("allocation_replay", e))?;
    let prior = rows
        .iter()
        .map(ledger_entry_from_row)
        .collect::<StoreResult<Vec<_>>>()?;

    let Some(legs) = prior_allocation(&prior, request)? else {
        return Ok(None);
    };
    debug!(legs = legs.len(), "allocation replayed");
    Ok(Some(AllocationResult {
        plan: plan_from_legs(request, &legs),
        entries: legs,
        replayed: true,
    }))
}

async fn find_batch(
    conn: &mut PgConnection,
    item_id: ItemId,
    warehouse_id: WarehouseId,
    code: &str,
    for_update: bool,
) -> StoreResult<Option<Batch>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {BATCH_COLUMNS} FROM batches \
         WHERE item_id = $1 AND warehouse_id = $2 AND batch_code = $3{lock}"
    ))
    .bind(item_id.get())
    .bind(warehouse_id.get())
    .bind(code)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("find_batch", e))?;
    row.as_ref().map(batch_from_row).transpose()
}

/// Get-or-create. Losing an insert race falls back to the winner's row.
async fn ensure_batch(
    conn: &mut PgConnection,
    item_id: ItemId,
    warehouse_id: WarehouseId,
    code: &str,
    production_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
    on_date: NaiveDate,
) -> StoreResult<Batch> {
    if let Some(existing) = find_batch(conn, item_id, warehouse_id, code, false).await? {
        return Ok(existing);
    }
    let (production_date, expiry_date) =
        resolve_inbound_dates(production_date, expiry_date, on_date)?;

    let inserted = sqlx::query(&format!(
        "INSERT INTO batches (item_id, warehouse_id, batch_code, production_date, expiry_date) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (item_id, warehouse_id, batch_code) DO NOTHING \
         RETURNING {BATCH_COLUMNS}"
    ))
    .bind(item_id.get())
    .bind(warehouse_id.get())
    .bind(code)
    .bind(production_date)
    .bind(expiry_date)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_batch", e))?;

    match inserted {
        Some(row) => batch_from_row(&row),
        None => find_batch(conn, item_id, warehouse_id, code, false)
            .await?
            .ok_or_else(|| {
                DomainError::batch_resolution(format!(
                    "batch {code} of item {item_id} vanished after conflict"
                ))
                .into()
            }),
    }
}

/// Locks (creating if needed) the stock row of `key`; returns `(row id, qty)`.
async fn lock_slot(conn: &mut PgConnection, key: &StockKey) -> StoreResult<(i64, i64)> {
    sqlx::query(
        r#"
        INSERT INTO stocks (warehouse_id, item_id, batch_code, qty)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (warehouse_id, item_id, batch_code_key) DO NOTHING
        "#,
    )
    .bind(key.warehouse_id.get())
    .bind(key.item_id.get())
    .bind(key.batch.code())
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("ensure_slot", e))?;

    let row = sqlx::query(
        r#"
        SELECT id, qty FROM stocks
        WHERE warehouse_id = $1 AND item_id = $2 AND batch_code_key = $3
        FOR UPDATE
        "#,
    )
    .bind(key.warehouse_id.get())
    .bind(key.item_id.get())
    .bind(key.batch.as_key())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("lock_slot", e))?;

    Ok((get(&row, "id")?, get(&row, "qty")?))
}

/// Writes the ledger row and the new slot quantity. The slot must be locked.
async fn write_movement(
    conn: &mut PgConnection,
    slot_id: i64,
    movement: &Movement,
    after: i64,
) -> StoreResult<LedgerEntry> {
    sqlx::query("UPDATE stocks SET qty = $2, updated_at = NOW() WHERE id = $1")
        .bind(slot_id)
        .bind(after)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("update_slot", e))?;

    let trace_id = movement.effective_trace_id();
    let row = sqlx::query(
        r#"
        INSERT INTO stock_ledger (
            warehouse_id, item_id, batch_code, delta, reason,
            ref, ref_line, after_qty, occurred_at, trace_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(movement.key.warehouse_id.get())
    .bind(movement.key.item_id.get())
    .bind(movement.key.batch.code())
    .bind(movement.delta)
    .bind(movement.reason.as_str())
    .bind(&movement.reference)
    .bind(movement.ref_line)
    .bind(after)
    .bind(movement.occurred_at)
    .bind(trace_id.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::Concurrency(format!(
                "ledger entry ({}, {}) written concurrently",
                movement.reference, movement.ref_line
            ))
        } else {
            map_sqlx_error("insert_ledger", e)
        }
    })?;

    Ok(LedgerEntry {
        id: get(&row, "id")?,
        key: movement.key.clone(),
        delta: movement.delta,
        reason: movement.reason,
        reference: movement.reference.clone(),
        ref_line: movement.ref_line,
        after_qty: after,
        occurred_at: movement.occurred_at,
        trace_id,
    })
}

async fn load_candidates(
    conn: &mut PgConnection,
    item_id: ItemId,
    warehouse_id: WarehouseId,
    for_update: bool,
) -> StoreResult<Vec<(i64, FefoCandidate)>> {
    let lock = if for_update { " FOR UPDATE OF s" } else { "" };
    let rows = sqlx::query(&format!(
        "SELECT s.id, s.warehouse_id, s.item_id, s.batch_code_key, s.qty, b.expiry_date \
         FROM stocks s \
         LEFT JOIN batches b \
           ON b.item_id = s.item_id \
          AND b.warehouse_id = s.warehouse_id \
          AND b.batch_code = s.batch_code \
         WHERE s.item_id = $1 AND s.warehouse_id = $2 AND s.qty > 0 \
         ORDER BY s.id{lock}"
    ))
    .bind(item_id.get())
    .bind(warehouse_id.get())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_candidates", e))?;

    rows.iter()
        .map(|row| -> StoreResult<(i64, FefoCandidate)> {
            let id: i64 = get(row, "id")?;
            Ok((
                id,
                FefoCandidate {
                    key: stock_key_from_row(row)?,
                    qty: get(row, "qty")?,
                    expiry_date: get(row, "expiry_date")?,
                    slot_seq: id,
                },
            ))
        })
        .collect()
}

#[async_trait]
impl StockStore for PostgresStockStore {
    #[instrument(
        skip(self, movement),
        fields(
            key = %movement.key,
            reference = %movement.reference,
            ref_line = movement.ref_line,
            operation = tracing::field::Empty
        ),
        err
    )]
    async fn apply(&self, movement: Movement) -> StoreResult<ApplyOutcome> {
        movement.validate()?;
        let span = Span::current();

        let mut tx = self.begin().await?;

        if let Some(prior) =
            find_ledger_entry(&mut tx, &movement.reference, movement.ref_line).await?
        {
            span.record("operation", "replay");
            debug!(ledger_id = prior.id, "movement already applied");
            return Ok(ApplyOutcome::replayed(&prior));
        }

        if movement.delta == 0 {
            span.record("operation", "noop");
            let qty: Option<i64> = sqlx::query_scalar(
                "SELECT qty FROM stocks WHERE warehouse_id = $1 AND item_id = $2 AND batch_code_key = $3",
            )
            .bind(movement.key.warehouse_id.get())
            .bind(movement.key.item_id.get())
            .bind(movement.key.batch.as_key())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("read_slot", e))?;
            return Ok(ApplyOutcome::unchanged(movement.key.clone(), qty.unwrap_or(0)));
        }

        span.record("operation", "apply");
        let (slot_id, before) = lock_slot(&mut tx, &movement.key).await?;
        // A concurrent submission of the same (ref, ref_line) may have
        // committed while we waited on the slot lock.
        if let Some(prior) =
            find_ledger_entry(&mut tx, &movement.reference, movement.ref_line).await?
        {
            span.record("operation", "replay");
            debug!(ledger_id = prior.id, "movement applied concurrently");
            return Ok(ApplyOutcome::replayed(&prior));
        }
        let after = apply_delta(before, &movement)?;

        if let Some(code) = movement.key.batch.code() {
            ensure_batch(
                &mut tx,
                movement.key.item_id,
                movement.key.warehouse_id,
                code,
                movement.production_date,
                movement.expiry_date,
                movement.occurred_at.date_naive(),
            )
            .await?;
        }

        let entry = write_movement(&mut tx, slot_id, &movement, after).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(ApplyOutcome::applied(&entry))
    }

    #[instrument(skip(self), fields(item_id = %item_id, warehouse_id = %warehouse_id), err)]
    async fn resolve_batch(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        production_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        on_date: NaiveDate,
    ) -> StoreResult<Batch> {
        let key = required_batch_key(batch_code)?;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        ensure_batch(
            &mut conn,
            item_id,
            warehouse_id,
            key.as_key(),
            production_date,
            expiry_date,
            on_date,
        )
        .await
    }

    #[instrument(skip(self), fields(item_id = %item_id, warehouse_id = %warehouse_id), err)]
    async fn correct_expiry(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        batch_code: &str,
        expiry_date: Option<NaiveDate>,
    ) -> StoreResult<Batch> {
        let key = required_batch_key(batch_code)?;
        let mut tx = self.begin().await?;

        let mut batch = find_batch(&mut tx, item_id, warehouse_id, key.as_key(), true)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("batch {key} of item {item_id}")))?;
        if let (Some(p), Some(e)) = (batch.production_date, expiry_date) {
            if e < p {
                return Err(DomainError::validation(format!(
                    "expiry_date ({e}) is before production_date ({p})"
                ))
                .into());
            }
        }

        sqlx::query("UPDATE batches SET expiry_date = $2 WHERE id = $1")
            .bind(batch.id)
            .bind(expiry_date)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("correct_expiry", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        batch.expiry_date = expiry_date;
        Ok(batch)
    }

    async fn batches(&self) -> StoreResult<Vec<Batch>> {
        let rows = sqlx::query(&format!("SELECT {BATCH_COLUMNS} FROM batches ORDER BY id"))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("batches", e))?;
        rows.iter().map(batch_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn ledger_totals(&self, cut: LedgerCut) -> StoreResult<BTreeMap<StockKey, i64>> {
        let (op, at) = match cut {
            LedgerCut::AtOrBefore(at) => ("<=", at),
            LedgerCut::Before(at) => ("<", at),
        };
        let rows = sqlx::query(&format!(
            "SELECT warehouse_id, item_id, batch_code_key, SUM(delta)::BIGINT AS qty \
             FROM stock_ledger \
             WHERE occurred_at {op} $1 \
             GROUP BY warehouse_id, item_id, batch_code_key \
             HAVING SUM(delta) <> 0"
        ))
        .bind(at)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_totals", e))?;

        rows.iter()
            .map(|row| -> StoreResult<(StockKey, i64)> {
                Ok((stock_key_from_row(row)?, get(row, "qty")?))
            })
            .collect()
    }

    async fn ledger_entries(&self, reference: &str) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledger WHERE ref = $1 ORDER BY ref_line"
        ))
        .bind(reference)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_entries", e))?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    async fn ledger_stats(&self, since: DateTime<Utc>) -> StoreResult<LedgerStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS ledger_rows,
                COUNT(*) FILTER (WHERE delta < 0) AS outbound_rows,
                COUNT(*) FILTER (WHERE occurred_at >= $1) AS rows_since
            FROM stock_ledger
            "#,
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_stats", e))?;

        Ok(LedgerStats {
            ledger_rows: get::<i64>(&row, "ledger_rows")? as u64,
            outbound_rows: get::<i64>(&row, "outbound_rows")? as u64,
            rows_since: get::<i64>(&row, "rows_since")? as u64,
        })
    }

    async fn ledger_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM stock_ledger \
             WHERE occurred_at >= $1 AND occurred_at <= $2 \
             ORDER BY occurred_at, id"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_between", e))?;
        rows.iter().map(ledger_entry_from_row).collect()
    }

    async fn key_balances(&self, keys: &[StockKey]) -> StoreResult<Vec<KeyBalance>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let warehouses: Vec<i64> = keys.iter().map(|k| k.warehouse_id.get()).collect();
        let items: Vec<i64> = keys.iter().map(|k| k.item_id.get()).collect();
        let batches: Vec<String> = keys.iter().map(|k| k.batch.as_key().to_string()).collect();

        let rows = sqlx::query(
            r#"
            SELECT k.warehouse_id, k.item_id, k.batch_code_key,
                   COALESCE((
                       SELECT SUM(l.delta) FROM stock_ledger l
                       WHERE l.warehouse_id = k.warehouse_id
                         AND l.item_id = k.item_id
                         AND l.batch_code_key = k.batch_code_key
                   ), 0)::BIGINT AS ledger_qty,
                   COALESCE(s.qty, 0)::BIGINT AS stock_qty
            FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[])
                 AS k(warehouse_id, item_id, batch_code_key)
            LEFT JOIN stocks s
              ON s.warehouse_id = k.warehouse_id
             AND s.item_id = k.item_id
             AND s.batch_code_key = k.batch_code_key
            "#,
        )
        .bind(&warehouses)
        .bind(&items)
        .bind(&batches)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("key_balances", e))?;

        rows.iter()
            .map(|row| -> StoreResult<KeyBalance> {
                Ok(KeyBalance {
                    key: stock_key_from_row(row)?,
                    ledger_qty: get(row, "ledger_qty")?,
                    stock_qty: get(row, "stock_qty")?,
                })
            })
            .collect()
    }

    async fn stock_slots(&self) -> StoreResult<Vec<StockSlot>> {
        let rows = sqlx::query(
            "SELECT warehouse_id, item_id, batch_code_key, qty FROM stocks \
             ORDER BY warehouse_id, item_id, batch_code_key",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock_slots", e))?;

        rows.iter()
            .map(|row| -> StoreResult<StockSlot> {
                Ok(StockSlot {
                    key: stock_key_from_row(row)?,
                    qty: get(row, "qty")?,
                })
            })
            .collect()
    }

    async fn snapshot_rows(&self, date: NaiveDate) -> StoreResult<Vec<SnapshotRow>> {
        let rows = sqlx::query(
            r#"
            SELECT snapshot_date, warehouse_id, item_id, batch_code_key,
                   qty_on_hand, qty_available, qty_allocated
            FROM stock_snapshots
            WHERE snapshot_date = $1
            ORDER BY warehouse_id, item_id, batch_code_key
            "#,
        )
        .bind(date)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot_rows", e))?;

        rows.iter()
            .map(|row| -> StoreResult<SnapshotRow> {
                Ok(SnapshotRow {
                    snapshot_date: get(row, "snapshot_date")?,
                    key: stock_key_from_row(row)?,
                    qty_on_hand: get(row, "qty_on_hand")?,
                    qty_available: get(row, "qty_available")?,
                    qty_allocated: get(row, "qty_allocated")?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(snapshot_date = %date), err)]
    async fn rebuild_snapshot(&self, date: NaiveDate) -> StoreResult<SnapshotSummary> {
        let mut tx = self.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("stock_snapshot:{date}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("snapshot_lock", e))?;

        sqlx::query("DELETE FROM stock_snapshots WHERE snapshot_date = $1")
            .bind(date)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("snapshot_delete", e))?;

        sqlx::query(
            r#"
            INSERT INTO stock_snapshots (
                snapshot_date, warehouse_id, item_id, batch_code,
                qty_on_hand, qty_available, qty_allocated
            )
            SELECT
                $1,
                warehouse_id,
                item_id,
                NULLIF(batch_code_key, '__NULL_BATCH__'),
                SUM(delta)::BIGINT,
                SUM(delta)::BIGINT,
                0
            FROM stock_ledger
            WHERE occurred_at < $2
            GROUP BY warehouse_id, item_id, batch_code_key
            HAVING SUM(delta) <> 0
            "#,
        )
        .bind(date)
        .bind(snapshot_cutoff(date))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("snapshot_insert", e))?;

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS slot_count, COALESCE(SUM(qty_on_hand), 0)::BIGINT AS total_qty
            FROM stock_snapshots
            WHERE snapshot_date = $1
            "#,
        )
        .bind(date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("snapshot_summary", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(SnapshotSummary {
            snapshot_date: Some(date),
            slot_count: get::<i64>(&row, "slot_count")? as usize,
            total_qty: get(&row, "total_qty")?,
        })
    }

    async fn plan_allocation(
        &self,
        item_id: ItemId,
        warehouse_id: WarehouseId,
        qty: i64,
        options: &PlanOptions,
    ) -> StoreResult<AllocationPlan> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let candidates: Vec<FefoCandidate> =
            load_candidates(&mut conn, item_id, warehouse_id, false)
                .await?
                .into_iter()
                .map(|(_, c)| c)
                .collect();
        Ok(plan(item_id, warehouse_id, qty, &candidates, options)?)
    }

    #[instrument(
        skip(self, request),
        fields(
            item_id = %request.item_id,
            warehouse_id = %request.warehouse_id,
            qty = request.qty,
            reference = %request.reference
        ),
        err
    )]
    async fn allocate(&self, request: &AllocationRequest) -> StoreResult<AllocationResult> {
        let mut tx = self.begin().await?;

        if let Some(result) = replay_allocation(&mut tx, request).await? {
            return Ok(result);
        }

        let locked = load_candidates(&mut tx, request.item_id, request.warehouse_id, true).await?;
        // A concurrent duplicate may have committed while we waited on the slot locks.
        if let Some(result) = replay_allocation(&mut tx, request).await? {
            return Ok(result);
        }
        let candidates: Vec<FefoCandidate> = locked.iter().map(|(_, c)| c.clone()).collect();
        let plan = plan(
            request.item_id,
            request.warehouse_id,
            request.qty,
            &candidates,
            &request.plan_options(),
        )?;

        let mut entries = Vec::with_capacity(plan.legs.len());
        for (leg, ref_line) in plan.legs.iter().zip(request.start_ref_line..) {
            let (slot_id, before) = locked
                .iter()
                .find(|(_, c)| c.key == leg.key)
                .map(|(id, c)| (*id, c.qty))
                .ok_or_else(|| StoreError::storage(format!("planned slot {} not locked", leg.key)))?;
            let movement = request.leg_movement(leg.key.clone(), leg.qty, ref_line);
            movement.validate()?;
            let after = apply_delta(before, &movement)?;
            entries.push(write_movement(&mut tx, slot_id, &movement, after).await?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(AllocationResult {
            plan,
            entries,
            replayed: false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresReservationStore {
    pool: Arc<PgPool>,
}

impl PostgresReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> StoreResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

const RESERVATION_COLUMNS: &str =
    "id, platform, shop_id, warehouse_id, ref, status, trace_id, created_at, updated_at, expire_at";

async fn advisory_lock(conn: &mut PgConnection, key: &str) -> StoreResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;
    Ok(())
}

async fn load_lines(conn: &mut PgConnection, id: Uuid) -> StoreResult<Vec<ReservationLine>> {
    let rows = sqlx::query(
        "SELECT ref_line, item_id, qty, consumed_qty FROM reservation_lines \
         WHERE reservation_id = $1 ORDER BY ref_line",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_lines", e))?;

    rows.iter()
        .map(|row| -> StoreResult<ReservationLine> {
            Ok(ReservationLine {
                ref_line: get(row, "ref_line")?,
                item_id: ItemId::new(get(row, "item_id")?).map_err(corrupt)?,
                qty: get(row, "qty")?,
                consumed_qty: get(row, "consumed_qty")?,
            })
        })
        .collect()
}

async fn reservation_from_row(conn: &mut PgConnection, row: &PgRow) -> StoreResult<Reservation> {
    let id: Uuid = get(row, "id")?;
    let status: String = get(row, "status")?;
    let trace_id: String = get(row, "trace_id")?;
    Ok(Reservation {
        id: ReservationId::from_uuid(id),
        key: reservation_key_from_row(row)?,
        status: status.parse::<ReservationStatus>().map_err(corrupt)?,
        trace_id: TraceId::new(trace_id),
        lines: load_lines(conn, id).await?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        expire_at: get(row, "expire_at")?,
    })
}

async fn load_reservation(
    conn: &mut PgConnection,
    id: ReservationId,
    for_update: bool,
) -> StoreResult<Option<Reservation>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1{lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("load_reservation", e))?;
    match row {
        Some(row) => Ok(Some(reservation_from_row(conn, &row).await?)),
        None => Ok(None),
    }
}

async fn lock_key_of(conn: &mut PgConnection, id: ReservationId) -> StoreResult<Option<String>> {
    let row = sqlx::query(
        "SELECT platform, shop_id, warehouse_id, ref FROM reservations WHERE id = $1",
    )
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("reservation_key", e))?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(reservation_key_from_row(&row)?.lock_key()))
}

/// Advisory lock on the business key, then the row lock.
async fn lock_reservation(
    conn: &mut PgConnection,
    id: ReservationId,
) -> StoreResult<Option<Reservation>> {
    let Some(lock_key) = lock_key_of(conn, id).await? else {
        return Ok(None);
    };
    advisory_lock(conn, &lock_key).await?;
    load_reservation(conn, id, true).await
}

async fn save_reservation(conn: &mut PgConnection, r: &Reservation) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO reservations (
            id, platform, shop_id, warehouse_id, ref, status,
            trace_id, created_at, updated_at, expire_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            trace_id = EXCLUDED.trace_id,
            updated_at = EXCLUDED.updated_at,
            expire_at = EXCLUDED.expire_at
        "#,
    )
    .bind(r.id.as_uuid())
    .bind(&r.key.platform)
    .bind(&r.key.shop_id)
    .bind(r.key.warehouse_id.get())
    .bind(&r.key.reference)
    .bind(r.status.as_str())
    .bind(r.trace_id.as_str())
    .bind(r.created_at)
    .bind(r.updated_at)
    .bind(r.expire_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_reservation", e))?;

    for line in &r.lines {
        sqlx::query(
            r#"
            INSERT INTO reservation_lines (reservation_id, ref_line, item_id, qty, consumed_qty)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (reservation_id, ref_line) DO UPDATE SET
                item_id = EXCLUDED.item_id,
                qty = EXCLUDED.qty,
                consumed_qty = EXCLUDED.consumed_qty
            "#,
        )
        .bind(r.id.as_uuid())
        .bind(line.ref_line)
        .bind(line.item_id.get())
        .bind(line.qty)
        .bind(line.consumed_qty)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("save_reservation_line", e))?;
    }
    Ok(())
}

#[async_trait]
impl ReservationStore for PostgresReservationStore {
    #[instrument(skip(self, new), fields(reservation_key = %new.key.lock_key()), err)]
    async fn create(
        &self,
        new: NewReservation,
        now: DateTime<Utc>,
    ) -> StoreResult<CreatedReservation> {
        new.validate()?;
        let mut tx = self.begin().await?;
        advisory_lock(&mut tx, &new.key.lock_key()).await?;

        let existing = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE platform = $1 AND shop_id = $2 AND warehouse_id = $3 AND ref = $4 \
             FOR UPDATE"
        ))
        .bind(&new.key.platform)
        .bind(&new.key.shop_id)
        .bind(new.key.warehouse_id.get())
        .bind(&new.key.reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_reservation_by_key", e))?;

        let (reservation, created) = match existing {
            Some(row) => {
                let mut r = reservation_from_row(&mut tx, &row).await?;
                r.refresh(&new, now)?;
                (r, false)
            }
            None => (Reservation::open(ReservationId::new(), &new, now)?, true),
        };
        save_reservation(&mut tx, &reservation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CreatedReservation {
            reservation,
            created,
        })
    }

    async fn get(&self, id: ReservationId) -> StoreResult<Option<Reservation>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_reservation(&mut conn, id, false).await
    }

    async fn find_by_key(&self, key: &ReservationKey) -> StoreResult<Option<Reservation>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let row = sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations \
             WHERE platform = $1 AND shop_id = $2 AND warehouse_id = $3 AND ref = $4"
        ))
        .bind(&key.platform)
        .bind(&key.shop_id)
        .bind(key.warehouse_id.get())
        .bind(&key.reference)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_reservation_by_key", e))?;
        match row {
            Some(row) => Ok(Some(reservation_from_row(&mut conn, &row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn consume(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<(Reservation, ConsumeOutcome)> {
        let mut tx = self.begin().await?;
        let mut r = lock_reservation(&mut tx, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("reservation {id}")))?;
        let outcome = r.consume(now)?;
        if outcome == ConsumeOutcome::Consumed {
            save_reservation(&mut tx, &r).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok((r, outcome))
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn cancel(&self, id: ReservationId, now: DateTime<Utc>) -> StoreResult<Reservation> {
        let mut tx = self.begin().await?;
        let mut r = lock_reservation(&mut tx, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("reservation {id}")))?;
        r.cancel(now)?;
        save_reservation(&mut tx, &r).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(r)
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ReservationId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM reservations
            WHERE status = 'open' AND expire_at < $1
            ORDER BY expire_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_expired", e))?;
        Ok(ids.into_iter().map(ReservationId::from_uuid).collect())
    }

    #[instrument(skip(self), fields(reservation_id = %id), err)]
    async fn release_expired_by_id(
        &self,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreResult<ReleaseOutcome> {
        let mut tx = self.begin().await?;
        let Some(mut r) = lock_reservation(&mut tx, id).await? else {
            return Ok(ReleaseOutcome::Noop { id: None });
        };
        let outcome = r.expire(now);
        if outcome.is_expired() {
            save_reservation(&mut tx, &r).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::storage(format!("failed to read column {column}: {e}")))
}

fn corrupt(err: DomainError) -> StoreError {
    StoreError::storage(format!("invalid stored value: {err}"))
}

fn stock_key_from_row(row: &PgRow) -> StoreResult<StockKey> {
    Ok(StockKey::new(
        WarehouseId::new(get(row, "warehouse_id")?).map_err(corrupt)?,
        ItemId::new(get(row, "item_id")?).map_err(corrupt)?,
        BatchKey::from_key(get::<String>(row, "batch_code_key")?),
    ))
}

fn reservation_key_from_row(row: &PgRow) -> StoreResult<ReservationKey> {
    Ok(ReservationKey {
        platform: get(row, "platform")?,
        shop_id: get(row, "shop_id")?,
        warehouse_id: WarehouseId::new(get(row, "warehouse_id")?).map_err(corrupt)?,
        reference: get(row, "ref")?,
    })
}

fn ledger_entry_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let reason: String = get(row, "reason")?;
    let trace_id: String = get(row, "trace_id")?;
    Ok(LedgerEntry {
        id: get(row, "id")?,
        key: stock_key_from_row(row)?,
        delta: get(row, "delta")?,
        reason: reason.parse::<MovementReason>().map_err(corrupt)?,
        reference: get(row, "ref")?,
        ref_line: get(row, "ref_line")?,
        after_qty: get(row, "after_qty")?,
        occurred_at: get(row, "occurred_at")?,
        trace_id: TraceId::new(trace_id),
    })
}

fn batch_from_row(row: &PgRow) -> StoreResult<Batch> {
    Ok(Batch {
        id: get(row, "id")?,
        item_id: ItemId::new(get(row, "item_id")?).map_err(corrupt)?,
        warehouse_id: WarehouseId::new(get(row, "warehouse_id")?).map_err(corrupt)?,
        batch_code: get(row, "batch_code")?,
        production_date: get(row, "production_date")?,
        expiry_date: get(row, "expiry_date")?,
        created_at: get(row, "created_at")?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Concurrency(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Runs against a real database only when `DATABASE_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use stockledger_inventory::NewReservationLine;

    async fn pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        migrate(&pool).await.ok()?;
        Some(pool)
    }

    /// Distinct ids per run so repeated runs against one database do not collide.
    fn unique_item() -> ItemId {
        let raw = (Uuid::now_v7().as_u128() % 1_000_000_000) as i64 + 1;
        ItemId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn apply_allocate_and_snapshot_round_trip() {
        let Some(pool) = pool().await else {
            return;
        };
        let store = PostgresStockStore::new(pool);
        let item = unique_item();
        let wh = WarehouseId::new(1).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let tag = item.get();

        for (code, qty, expiry) in [("EARLY", 5, (2025, 1, 10)), ("LATE", 10, (2025, 2, 1))] {
            let m = Movement::new(
                StockKey::new(wh, item, BatchKey::from_code(Some(code)).unwrap()),
                qty,
                MovementReason::Receipt,
                format!("PO-{tag}-{code}"),
                1,
                at,
            )
            .with_dates(None, NaiveDate::from_ymd_opt(expiry.0, expiry.1, expiry.2));
            assert!(store.apply(m.clone()).await.unwrap().applied);
            assert!(!store.apply(m).await.unwrap().applied);
        }

        let request = AllocationRequest::new(item, wh, 8, format!("SO-{tag}"), at);
        let result = store.allocate(&request).await.unwrap();
        let legs: Vec<_> = result.entries.iter().map(|e| (e.key.batch.as_key().to_string(), e.delta)).collect();
        assert_eq!(legs, vec![("EARLY".to_string(), -5), ("LATE".to_string(), -3)]);
        assert!(store.allocate(&request).await.unwrap().replayed);

        let d = at.date_naive();
        let first = store.rebuild_snapshot(d).await.unwrap();
        let second = store.rebuild_snapshot(d).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn foreign_movement_on_the_start_line_refuses_allocation() {
        let Some(pool) = pool().await else {
            return;
        };
        let store = PostgresStockStore::new(pool);
        let (item, other) = (unique_item(), unique_item());
        let wh = WarehouseId::new(1).unwrap();
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let reference = format!("SO-{}", item.get());

        let stocked = StockKey::new(wh, item, BatchKey::none());
        let receipt = |key: StockKey, qty: i64, reference: String| {
            Movement::new(key, qty, MovementReason::Receipt, reference, 1, at)
        };
        store
            .apply(receipt(stocked.clone(), 10, format!("PO-{}", item.get())))
            .await
            .unwrap();
        // Another item's receipt sits on the line the allocation would start at.
        store
            .apply(receipt(StockKey::new(wh, other, BatchKey::none()), 3, reference.clone()))
            .await
            .unwrap();

        let err = store
            .allocate(&AllocationRequest::new(item, wh, 4, reference, at))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::Conflict(_))));
        let balances = store.key_balances(&[stocked]).await.unwrap();
        assert_eq!((balances[0].ledger_qty, balances[0].stock_qty), (10, 10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_apply_is_a_replay() {
        let Some(pool) = pool().await else {
            return;
        };
        let store = Arc::new(PostgresStockStore::new(pool));
        let item = unique_item();
        let key = StockKey::new(WarehouseId::new(1).unwrap(), item, BatchKey::none());
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
        let reference = format!("PO-{}", item.get());
        let m = Movement::new(key.clone(), 6, MovementReason::Receipt, reference, 1, at);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (store, m) = (store.clone(), m.clone());
                tokio::spawn(async move { store.apply(m).await })
            })
            .collect();
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap().unwrap().applied {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let balances = store.key_balances(&[key]).await.unwrap();
        assert_eq!((balances[0].ledger_qty, balances[0].stock_qty), (6, 6));
        let window = store.ledger_between(at, at).await.unwrap();
        assert_eq!(window.iter().filter(|e| e.key.item_id == item).count(), 1);
    }

    #[tokio::test]
    async fn reservation_expires_once() {
        let Some(pool) = pool().await else {
            return;
        };
        let store = PostgresReservationStore::new(pool);
        let now = Utc::now();
        let new = NewReservation {
            key: ReservationKey::new("test", "S1", WarehouseId::new(1).unwrap(), Uuid::now_v7().to_string()),
            lines: vec![NewReservationLine {
                ref_line: 1,
                item_id: unique_item(),
                qty: 3,
            }],
            expire_at: now - Duration::minutes(1),
            trace_id: None,
        };
        let created = store.create(new, now).await.unwrap();
        let id = created.reservation.id;

        assert!(store.release_expired_by_id(id, now).await.unwrap().is_expired());
        assert!(!store.release_expired_by_id(id, now).await.unwrap().is_expired());
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            ReservationStatus::Expired
        );
    }
}
