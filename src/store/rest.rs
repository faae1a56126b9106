// =============================================================================
// REST Store — PostgREST gateway backend (Supabase-compatible)
// =============================================================================
//
// Same table contract as the SQL backend, reached through a PostgREST
// endpoint instead of a direct connection. Upserts use the `on_conflict`
// query parameter with `Prefer: resolution=merge-duplicates`; feedback
// dedup rides `resolution=ignore-duplicates` plus `return=representation`
// so an empty response body means the row already existed.
// =============================================================================

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::calibration::SymbolCalibration;
use crate::feedback::TradeFeedback;
use crate::store::{FeedbackStore, ModelMetrics};
use crate::trace::PredictionTrace;
use crate::types::{CalKey, Timeframe};

#[derive(Debug, Deserialize)]
struct CalibrationRow {
    symbol: String,
    timeframe: String,
    wins: i64,
    total: i64,
    drift_factor: f64,
    last_updated: DateTime<Utc>,
}

impl CalibrationRow {
    fn into_calibration(self) -> SymbolCalibration {
        SymbolCalibration {
            wins: self.wins.max(0) as u32,
            total: self.total.max(0) as u32,
            drift_factor: self.drift_factor,
            last_updated: self.last_updated,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrainingDateRow {
    training_date: DateTime<Utc>,
}

pub struct RestStore {
    client: Client,
    base: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key_value =
            HeaderValue::from_str(api_key).context("SUPABASE_KEY is not a valid header value")?;
        headers.insert("apikey", key_value);
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .context("SUPABASE_KEY is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build REST client")?;

        let base = format!("{}/rest/v1", base_url.trim_end_matches('/'));
        info!(base = %base, "rest store ready");
        Ok(Self { client, base })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/{name}", self.base)
    }

    async fn insert(&self, table: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(self.table(table))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {table} failed"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("POST {table} returned {status}: {detail}"));
        }
        Ok(())
    }
}

#[async_trait]
impl FeedbackStore for RestStore {
    async fn read_calibration(&self, key: &CalKey) -> Result<Option<SymbolCalibration>> {
        let rows: Vec<CalibrationRow> = self
            .client
            .get(self.table("symbol_calibration"))
            .query(&[
                ("symbol", format!("eq.{}", key.symbol)),
                ("timeframe", format!("eq.{}", key.timeframe)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .context("GET symbol_calibration failed")?
            .error_for_status()
            .context("GET symbol_calibration returned an error status")?
            .json()
            .await
            .context("symbol_calibration response was not valid JSON")?;

        Ok(rows.into_iter().next().map(CalibrationRow::into_calibration))
    }

    async fn upsert_calibration(&self, key: &CalKey, cal: &SymbolCalibration) -> Result<()> {
        let body = json!({
            "symbol": key.symbol,
            "timeframe": key.timeframe.to_string(),
            "wins": cal.wins,
            "total": cal.total,
            "drift_factor": cal.drift_factor,
            "last_updated": cal.last_updated,
        });
        let response = self
            .client
            .post(self.table("symbol_calibration"))
            .query(&[("on_conflict", "symbol,timeframe")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&body)
            .send()
            .await
            .context("POST symbol_calibration failed")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("upsert_calibration returned {status}: {detail}"));
        }
        Ok(())
    }

    async fn append_feedback(&self, feedback: &TradeFeedback) -> Result<bool> {
        let body = json!({
            "symbol": feedback.symbol,
            "timeframe": feedback.timeframe.to_string(),
            "side": feedback.side.to_string(),
            "open_time": feedback.open_time,
            "close_time": feedback.close_time,
            "entry_price": feedback.entry_price,
            "exit_price": feedback.exit_price,
            "profit": feedback.profit,
            "ai_confidence": feedback.ai_confidence,
            "coherent_confidence": feedback.coherent_confidence,
            "decision": feedback.decision,
            "is_win": feedback.is_win(),
            "created_at": Utc::now(),
        });
        let response = self
            .client
            .post(self.table("trade_feedback"))
            .query(&[("on_conflict", "symbol,open_time,close_time,entry_price,exit_price")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&body)
            .send()
            .await
            .context("POST trade_feedback failed")?;

        // Older PostgREST builds answer a duplicate with 409 instead of an
        // empty representation.
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("append_feedback returned {status}: {detail}"));
        }
        let inserted: Vec<serde_json::Value> = response
            .json()
            .await
            .context("trade_feedback response was not valid JSON")?;
        Ok(!inserted.is_empty())
    }

    async fn count_feedback(&self, key: &CalKey) -> Result<u64> {
        // PostgREST reports the exact count in the Content-Range header
        // ("0-0/123"); the body itself is kept to one row.
        let response = self
            .client
            .get(self.table("trade_feedback"))
            .query(&[
                ("select", "symbol".to_string()),
                ("symbol", format!("eq.{}", key.symbol)),
                ("timeframe", format!("eq.{}", key.timeframe)),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact")
            .send()
            .await
            .context("GET trade_feedback count failed")?
            .error_for_status()
            .context("GET trade_feedback count returned an error status")?;

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|n| n.parse::<u64>().ok())
            .context("missing or malformed content-range header")
    }

    async fn append_trace(&self, trace: &PredictionTrace) -> Result<()> {
        self.insert(
            "predictions",
            json!({
                "symbol": trace.symbol,
                "timeframe": trace.timeframe.to_string(),
                "prediction": trace.prediction.to_string(),
                "confidence": trace.confidence,
                "reason": trace.reason.join(","),
                "model_used": trace.model_used,
                "metadata": {
                    "trace_id": trace.id,
                    "snapshot_hash": trace.snapshot_hash,
                },
                "created_at": trace.created_at,
            }),
        )
        .await
    }

    async fn append_metrics(&self, metrics: &ModelMetrics) -> Result<()> {
        self.insert(
            "model_metrics",
            json!({
                "symbol": metrics.symbol,
                "timeframe": metrics.timeframe.to_string(),
                "model_type": metrics.model_type,
                "accuracy": metrics.accuracy,
                "f1_score": metrics.f1_score,
                "training_samples": metrics.training_samples,
                "training_date": metrics.training_date,
                "feature_importance": metrics.feature_importance,
                "metadata": metrics.metadata,
            }),
        )
        .await
    }

    async fn read_all_calibrations(&self) -> Result<Vec<(CalKey, SymbolCalibration)>> {
        let rows: Vec<CalibrationRow> = self
            .client
            .get(self.table("symbol_calibration"))
            .query(&[("order", "symbol.asc,timeframe.asc")])
            .send()
            .await
            .context("GET symbol_calibration failed")?
            .error_for_status()
            .context("GET symbol_calibration returned an error status")?
            .json()
            .await
            .context("symbol_calibration response was not valid JSON")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let timeframe = match Timeframe::from_str(&row.timeframe) {
                Ok(tf) => tf,
                Err(e) => {
                    warn!(symbol = %row.symbol, timeframe = %row.timeframe, error = %e,
                        "skipping calibration row");
                    continue;
                }
            };
            let key = CalKey::new(row.symbol.clone(), timeframe);
            out.push((key, row.into_calibration()));
        }
        Ok(out)
    }

    async fn latest_training_date(&self, key: &CalKey) -> Result<Option<DateTime<Utc>>> {
        let rows: Vec<TrainingDateRow> = self
            .client
            .get(self.table("model_metrics"))
            .query(&[
                ("select", "training_date".to_string()),
                ("symbol", format!("eq.{}", key.symbol)),
                ("timeframe", format!("eq.{}", key.timeframe)),
                ("order", "training_date.desc".to_string()),
                ("limit", "1".to_string()),
            ])
            .send()
            .await
            .context("GET model_metrics failed")?
            .error_for_status()
            .context("GET model_metrics returned an error status")?
            .json()
            .await
            .context("model_metrics response was not valid JSON")?;

        Ok(rows.into_iter().next().map(|r| r.training_date))
    }
}
