use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::api::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub store: ServiceHealth,
    pub signing: ServiceHealth,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    pub response_time_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    fn from_result<E: std::fmt::Display>(start: Instant, result: Result<(), E>) -> Self {
        match result {
            Ok(()) => ServiceHealth {
                status: "healthy".to_string(),
                response_time_ms: start.elapsed().as_millis(),
                error: None,
            },
            Err(e) => ServiceHealth {
                status: "unhealthy".to_string(),
                response_time_ms: start.elapsed().as_millis(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Health check endpoint
/// Returns 200 if the store is reachable and the signing credentials load, 503 otherwise
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = Instant::now();

    let store_health = check_store(&state).await;
    let signing_health = check_signing(&state).await;

    let all_healthy = store_health.status == "healthy" && signing_health.status == "healthy";

    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dependencies: DependencyStatus {
            store: store_health,
            signing: signing_health,
        },
    };

    tracing::info!(
        status = %response.status,
        duration_ms = start.elapsed().as_millis(),
        "Health check completed"
    );

    (status_code, Json(response))
}

async fn check_store(state: &AppState) -> ServiceHealth {
    let start = Instant::now();
    let result = state
        .store
        .ping()
        .await
        .map_err(|e| format!("Store error: {}", e));
    ServiceHealth::from_result(start, result)
}

/// Loads the PKCS#12 bundle and checks the certificate has not expired
async fn check_signing(state: &AppState) -> ServiceHealth {
    let start = Instant::now();
    let builder = state.builder.clone();

    let result = match tokio::task::spawn_blocking(move || builder.credentials().check()).await {
        Ok(Ok(status)) => {
            tracing::debug!(not_after = %status.not_after, "Signing certificate loaded");
            Ok(())
        }
        Ok(Err(e)) => Err(format!("Signing error: {}", e)),
        Err(e) => Err(format!("Signing check failed: {}", e)),
    };
    ServiceHealth::from_result(start, result)
}
