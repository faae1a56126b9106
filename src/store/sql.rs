// =============================================================================
// SQL Store — direct Postgres backend via sqlx
// =============================================================================
//
// Bounded pool (default 10 connections); callers queue on the pool up to
// their request deadline. Schema is created on startup if missing; the
// feedback dedup is enforced by a unique index so retries from the EA hit
// ON CONFLICT DO NOTHING instead of double-counting.
//
// TLS: pass `sslmode=require` in DATABASE_URL for hosted services.
// =============================================================================

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::calibration::SymbolCalibration;
use crate::feedback::TradeFeedback;
use crate::store::{FeedbackStore, ModelMetrics};
use crate::trace::PredictionTrace;
use crate::types::{CalKey, Timeframe};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS symbol_calibration (
    symbol       TEXT NOT NULL,
    timeframe    TEXT NOT NULL,
    wins         INT NOT NULL DEFAULT 0,
    total        INT NOT NULL DEFAULT 0,
    drift_factor DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    last_updated TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (symbol, timeframe)
);

CREATE TABLE IF NOT EXISTS trade_feedback (
    symbol               TEXT NOT NULL,
    timeframe            TEXT NOT NULL,
    side                 TEXT NOT NULL,
    open_time            TIMESTAMPTZ NOT NULL,
    close_time           TIMESTAMPTZ NOT NULL,
    entry_price          DOUBLE PRECISION NOT NULL,
    exit_price           DOUBLE PRECISION NOT NULL,
    profit               DOUBLE PRECISION NOT NULL,
    ai_confidence        DOUBLE PRECISION,
    coherent_confidence  DOUBLE PRECISION,
    decision             TEXT,
    is_win               BOOLEAN NOT NULL,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS trade_feedback_dedup_idx
    ON trade_feedback (symbol, open_time, close_time, entry_price, exit_price);

CREATE TABLE IF NOT EXISTS predictions (
    symbol     TEXT NOT NULL,
    timeframe  TEXT NOT NULL,
    prediction TEXT NOT NULL,
    confidence DOUBLE PRECISION NOT NULL,
    reason     TEXT NOT NULL,
    model_used TEXT NOT NULL,
    metadata   JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS model_metrics (
    symbol             TEXT NOT NULL,
    timeframe          TEXT NOT NULL,
    model_type         TEXT NOT NULL,
    accuracy           DOUBLE PRECISION NOT NULL,
    f1_score           DOUBLE PRECISION NOT NULL,
    training_samples   INT NOT NULL,
    training_date      TIMESTAMPTZ NOT NULL,
    feature_importance JSONB,
    metadata           JSONB
);
"#;

pub struct SqlStore {
    pool: PgPool,
}

impl SqlStore {
    /// Connect with a bounded pool and create the schema if missing.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialise schema")?;

        info!(max_connections, "sql store connected");
        Ok(Self { pool })
    }

    fn calibration_from_row(row: &PgRow) -> Result<SymbolCalibration> {
        Ok(SymbolCalibration {
            wins: row.try_get::<i32, _>("wins")?.max(0) as u32,
            total: row.try_get::<i32, _>("total")?.max(0) as u32,
            drift_factor: row.try_get("drift_factor")?,
            last_updated: row.try_get("last_updated")?,
        })
    }
}

#[async_trait]
impl FeedbackStore for SqlStore {
    async fn read_calibration(&self, key: &CalKey) -> Result<Option<SymbolCalibration>> {
        let row = sqlx::query(
            "SELECT wins, total, drift_factor, last_updated \
             FROM symbol_calibration WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("read_calibration query failed")?;

        row.as_ref().map(Self::calibration_from_row).transpose()
    }

    async fn upsert_calibration(&self, key: &CalKey, cal: &SymbolCalibration) -> Result<()> {
        sqlx::query(
            "INSERT INTO symbol_calibration (symbol, timeframe, wins, total, drift_factor, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (symbol, timeframe) DO UPDATE SET \
                 wins = EXCLUDED.wins, \
                 total = EXCLUDED.total, \
                 drift_factor = EXCLUDED.drift_factor, \
                 last_updated = EXCLUDED.last_updated",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.to_string())
        .bind(cal.wins as i32)
        .bind(cal.total as i32)
        .bind(cal.drift_factor)
        .bind(cal.last_updated)
        .execute(&self.pool)
        .await
        .context("upsert_calibration query failed")?;
        Ok(())
    }

    async fn append_feedback(&self, feedback: &TradeFeedback) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO trade_feedback \
                 (symbol, timeframe, side, open_time, close_time, entry_price, exit_price, \
                  profit, ai_confidence, coherent_confidence, decision, is_win, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now()) \
             ON CONFLICT (symbol, open_time, close_time, entry_price, exit_price) DO NOTHING",
        )
        .bind(&feedback.symbol)
        .bind(feedback.timeframe.to_string())
        .bind(feedback.side.to_string())
        .bind(feedback.open_time)
        .bind(feedback.close_time)
        .bind(feedback.entry_price)
        .bind(feedback.exit_price)
        .bind(feedback.profit)
        .bind(feedback.ai_confidence)
        .bind(feedback.coherent_confidence)
        .bind(&feedback.decision)
        .bind(feedback.is_win())
        .execute(&self.pool)
        .await
        .context("append_feedback query failed")?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_feedback(&self, key: &CalKey) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM trade_feedback WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.to_string())
        .fetch_one(&self.pool)
        .await
        .context("count_feedback query failed")?;

        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }

    async fn append_trace(&self, trace: &PredictionTrace) -> Result<()> {
        let metadata = serde_json::json!({
            "trace_id": trace.id,
            "snapshot_hash": trace.snapshot_hash,
        });
        sqlx::query(
            "INSERT INTO predictions \
                 (symbol, timeframe, prediction, confidence, reason, model_used, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&trace.symbol)
        .bind(trace.timeframe.to_string())
        .bind(trace.prediction.to_string())
        .bind(trace.confidence)
        .bind(trace.reason.join(","))
        .bind(&trace.model_used)
        .bind(metadata)
        .bind(trace.created_at)
        .execute(&self.pool)
        .await
        .context("append_trace query failed")?;
        Ok(())
    }

    async fn append_metrics(&self, metrics: &ModelMetrics) -> Result<()> {
        sqlx::query(
            "INSERT INTO model_metrics \
                 (symbol, timeframe, model_type, accuracy, f1_score, training_samples, \
                  training_date, feature_importance, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&metrics.symbol)
        .bind(metrics.timeframe.to_string())
        .bind(&metrics.model_type)
        .bind(metrics.accuracy)
        .bind(metrics.f1_score)
        .bind(metrics.training_samples as i32)
        .bind(metrics.training_date)
        .bind(&metrics.feature_importance)
        .bind(&metrics.metadata)
        .execute(&self.pool)
        .await
        .context("append_metrics query failed")?;
        Ok(())
    }

    async fn read_all_calibrations(&self) -> Result<Vec<(CalKey, SymbolCalibration)>> {
        let rows = sqlx::query(
            "SELECT symbol, timeframe, wins, total, drift_factor, last_updated \
             FROM symbol_calibration ORDER BY symbol, timeframe",
        )
        .fetch_all(&self.pool)
        .await
        .context("read_all_calibrations query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let symbol: String = row.try_get("symbol")?;
            let tf_raw: String = row.try_get("timeframe")?;
            let timeframe = match Timeframe::from_str(&tf_raw) {
                Ok(tf) => tf,
                Err(e) => {
                    // Foreign rows (hand-inserted or from older EA builds)
                    // must not break the status endpoints.
                    warn!(symbol, timeframe = %tf_raw, error = %e, "skipping calibration row");
                    continue;
                }
            };
            out.push((CalKey::new(symbol, timeframe), Self::calibration_from_row(row)?));
        }
        Ok(out)
    }

    async fn latest_training_date(&self, key: &CalKey) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(training_date) AS latest FROM model_metrics \
             WHERE symbol = $1 AND timeframe = $2",
        )
        .bind(&key.symbol)
        .bind(key.timeframe.to_string())
        .fetch_one(&self.pool)
        .await
        .context("latest_training_date query failed")?;

        Ok(row.try_get::<Option<DateTime<Utc>>, _>("latest")?)
    }
}
