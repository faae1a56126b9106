// =============================================================================
// Service Error Taxonomy — HTTP boundary mapping
// =============================================================================
//
// Every failure below the API layer is either absorbed (trace write, optional
// calibration read) or surfaced here with a matching HTTP class. The decision
// endpoint itself must never fail for infrastructure reasons; the handlers
// enforce that by falling back to a degraded decision instead of returning
// one of these.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Snapshot violated the validator contract. `field` names the offender.
    #[error("invalid snapshot: {field}: {message}")]
    InvalidSnapshot { field: &'static str, message: String },

    /// The store did not answer within its sub-budget.
    #[error("persistence timed out during {stage}")]
    PersistenceTimeout { stage: &'static str },

    /// The store returned an error.
    #[error("persistence failed during {stage}: {source}")]
    Persistence {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Duplicate feedback. Not a failure; mapped to 200 with `duplicate:true`.
    #[error("duplicate feedback")]
    Conflict,

    /// Anything unexpected. The body stays opaque; details go to the log
    /// under the correlation id.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn persistence(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Persistence { stage, source }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidSnapshot { field, message } => {
                let body = serde_json::json!({
                    "error": "invalid_snapshot",
                    "field": field,
                    "detail": message,
                });
                (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
            }
            Self::PersistenceTimeout { stage } => {
                let body = serde_json::json!({
                    "error": "persistence_timeout",
                    "stage": stage,
                    "retryable": true,
                });
                (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
            }
            Self::Persistence { stage, source } => {
                error!(stage, error = %source, "persistence failure");
                let body = serde_json::json!({
                    "error": "persistence_failed",
                    "stage": stage,
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
            Self::Conflict => {
                let body = serde_json::json!({ "accepted": true, "duplicate": true });
                (StatusCode::OK, Json(body)).into_response()
            }
            Self::Internal(source) => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(correlation_id = %correlation_id, error = %source, "internal error");
                let body = serde_json::json!({
                    "error": "internal",
                    "correlation_id": correlation_id,
                });
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_snapshot_maps_to_422() {
        let err = ServiceError::InvalidSnapshot {
            field: "ask",
            message: "bid must be below ask".into(),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn timeout_maps_to_503() {
        let err = ServiceError::PersistenceTimeout { stage: "append_feedback" };
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn conflict_maps_to_200() {
        assert_eq!(ServiceError::Conflict.into_response().status(), StatusCode::OK);
    }

    #[test]
    fn persistence_maps_to_500() {
        let err = ServiceError::persistence("upsert_calibration", anyhow::anyhow!("boom"));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_display_names_the_field() {
        let err = ServiceError::InvalidSnapshot {
            field: "symbol",
            message: "must not be empty".into(),
        };
        assert!(err.to_string().contains("symbol"));
    }
}
