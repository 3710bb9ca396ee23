//! Background worker: snapshot pipeline, reconciliation guard and TTL sweeper
//! over the Postgres stores.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use stockledger_core::TraceId;
use stockledger_infra::runners::{
    AlertSink, ReconciliationAlert, ReconciliationGuard, RunnerConfig, SnapshotPipeline, TtlSweeper,
};
use stockledger_infra::store::postgres::migrate;
use stockledger_infra::{
    AuditSink, EngineConfig, EngineSettings, InventoryEngine, PostgresReservationStore,
    PostgresStockStore,
};
use stockledger_inventory::InventoryEvent;

/// Writes audit events to the structured log.
struct LogAudit;

impl AuditSink for LogAudit {
    fn publish(&self, event: &InventoryEvent, trace_id: Option<&TraceId>) {
        match serde_json::to_value(event) {
            Ok(payload) => tracing::info!(
                stream = event.stream(),
                stream_key = %event.stream_key(),
                trace_id = trace_id.map(TraceId::as_str),
                %payload,
                "audit"
            ),
            Err(err) => tracing::warn!(error = %err, "failed to encode audit event"),
        }
    }
}

/// Raises reconciliation alerts as error-level log lines.
struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: ReconciliationAlert) {
        tracing::error!(
            cut = %alert.cut,
            ledger_vs_stock = alert.ledger_vs_stock,
            ledger_vs_snapshot = alert.ledger_vs_snapshot,
            stock_vs_snapshot = alert.stock_vs_snapshot,
            "inventory drift detected"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockledger_observability::init();

    let cfg = EngineConfig::from_env().context("loading configuration")?;
    let url = cfg.require_database_url()?;

    if let Some(addr) = cfg.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing prometheus exporter")?;
        stockledger_infra::metrics::describe();
        tracing::info!(%addr, "metrics exporter listening");
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_max_connections)
        .connect(url)
        .await
        .context("connecting to postgres")?;
    migrate(&pool).await.context("applying schema")?;

    let engine = Arc::new(
        InventoryEngine::new(
            PostgresStockStore::new(pool.clone()),
            PostgresReservationStore::new(pool),
        )
        .with_settings(EngineSettings::from(&cfg))
        .with_audit(Arc::new(LogAudit)),
    );

    let handles = vec![
        RunnerConfig::from_engine(&cfg, cfg.snapshot_interval)
            .spawn(Arc::new(SnapshotPipeline::new(engine.clone()))),
        RunnerConfig::from_engine(&cfg, cfg.guard_interval).spawn(Arc::new(
            ReconciliationGuard::new(engine.clone(), Arc::new(LogAlertSink)),
        )),
        RunnerConfig::from_engine(&cfg, cfg.sweep_interval)
            .spawn(Arc::new(TtlSweeper::new(engine))),
    ];
    tracing::info!(runners = handles.len(), "worker started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");

    for handle in handles {
        let name = handle.name();
        handle.shutdown().await;
        tracing::debug!(runner = name, "runner stopped");
    }
    Ok(())
}
