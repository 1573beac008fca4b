use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;

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
    pub upstream: CheckResult,
    pub disk: CheckResult,
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

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Minimal subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_upstream(client: &reqwest::Client, base_url: &str) -> CheckResult {
    match client.head(base_url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {} returned {}", base_url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", base_url)),
    }
}

async fn check_disk(config: &Config) -> CheckResult {
    let cache_path = config.cache.path.clone();
    let disk_capacity = config.cache.disk_capacity;

    // Walk the cache directory off the async runtime.
    let result = tokio::task::spawn_blocking(move || {
        let dir = Path::new(&cache_path);
        if !dir.is_dir() {
            return None;
        }
        Some(dir_size(dir))
    })
    .await;

    match result {
        Ok(Some(used)) => {
            if used > disk_capacity {
                CheckResult::unhealthy(format!(
                    "disk tier holds {used} bytes, exceeding disk_capacity {disk_capacity}"
                ))
            } else {
                CheckResult {
                    ok: true,
                    detail: Some(format!("used {used} / {disk_capacity} bytes")),
                }
            }
        }
        Ok(None) => CheckResult::unhealthy("cache directory missing"),
        Err(e) => CheckResult::unhealthy(format!("disk check task failed: {e}")),
    }
}

/// Recursively compute the total size of all files under `dir`.
fn dir_size(dir: &Path) -> u64 {
    let mut total: u64 = 0;

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }

    total
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.upstream.ok && checks.disk.ok;
    // The disk tier is required; an unreachable upstream only degrades the
    // read-through path while cached objects stay servable.
    let any_critical = !checks.disk.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (upstream, disk) = tokio::join!(
        check_upstream(&state.http_client, &state.config.upstream.base_url),
        check_disk(&state.config),
    );

    let checks = HealthChecks { upstream, disk };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
