use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fred::clients::Pool;
use serde::Serialize;

use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub keydb: CheckResult,
    pub checkout_root: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// State shared by the observability routes.
#[derive(Clone)]
pub struct ObservabilityState {
    pub keydb: Pool,
    pub checkout_root: PathBuf,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_keydb(pool: &Pool) -> CheckResult {
    match crate::coordination::redis::ping(pool).await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

async fn check_checkout_root(root: &Path) -> CheckResult {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", root.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", root.display())),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // The store and the bus both live in KeyDB.
    if !checks.keydb.ok {
        HealthStatus::Unhealthy
    } else if !checks.checkout_root.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<ObservabilityState>) -> impl IntoResponse {
    let (keydb, checkout_root) = tokio::join!(
        check_keydb(&state.keydb),
        check_checkout_root(&state.checkout_root),
    );

    let checks = HealthChecks {
        keydb,
        checkout_root,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

/// `GET /metrics` in OpenMetrics text format.
pub async fn metrics_handler(State(state): State<ObservabilityState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode metrics: {e}")).into_response(),
    }
}

pub fn router(state: ObservabilityState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", axum::routing::get(health_handler))
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(keydb: bool, root: bool) -> HealthChecks {
        let result = |ok| {
            if ok {
                CheckResult::healthy()
            } else {
                CheckResult::unhealthy("down")
            }
        };
        HealthChecks {
            keydb: result(keydb),
            checkout_root: result(root),
        }
    }

    #[test]
    fn keydb_outage_is_unhealthy() {
        assert_eq!(aggregate_status(&checks(false, true)), HealthStatus::Unhealthy);
        assert_eq!(aggregate_status(&checks(true, false)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(true, true)), HealthStatus::Ok);
    }

    #[tokio::test]
    async fn checkout_root_must_be_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(check_checkout_root(tmp.path()).await.ok);

        let file = tmp.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(!check_checkout_root(&file).await.ok);
        assert!(!check_checkout_root(&tmp.path().join("missing")).await.ok);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
