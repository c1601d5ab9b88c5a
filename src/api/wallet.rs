//! Wallet web service endpoints polled by devices
//!
//! Pass fetches carry the pass's update tag in `Last-Modified`; devices echo it back
//! in `If-Modified-Since` and as `passesUpdatedSince`.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::auth::PassAuthorization;
use crate::api::state::AppState;
use crate::error::{AppError, Result};
use crate::models::RegistrationOutcome;
use crate::services::ledger::RegisterRequest;
use crate::services::update_query::{ChangedSerials, PassFetch};

pub const PKPASS_CONTENT_TYPE: &str = "application/vnd.apple.pkpass";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub push_token: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatedSinceQuery {
    #[serde(rename = "passesUpdatedSince")]
    pub passes_updated_since: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialNumbersResponse {
    pub serial_numbers: Vec<String>,
    pub last_updated: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceLogs {
    #[serde(default)]
    pub logs: Vec<String>,
}

fn require_token(auth: PassAuthorization) -> Result<String> {
    auth.0.ok_or(AppError::Unauthorized)
}

/// Tag from `If-Modified-Since`; HTTP dates and other values count as absent
fn if_modified_since(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::IF_MODIFIED_SINCE)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn parse_since(query: &UpdatedSinceQuery) -> Result<Option<i64>> {
    match query.passes_updated_since.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| {
            AppError::Validation(format!("passesUpdatedSince must be a tag, got {:?}", value))
        }),
    }
}

/// GET /v1/passes/:pass_type_id/:serial
async fn get_pass(
    State(state): State<AppState>,
    Path((pass_type_id, serial)): Path<(String, String)>,
    auth: PassAuthorization,
    headers: HeaderMap,
) -> Result<Response> {
    let token = require_token(auth)?;
    let since = if_modified_since(&headers);

    match state
        .updates
        .get_pass(&pass_type_id, &serial, &token, since)
        .await?
    {
        PassFetch::NotModified { update_tag } => Ok((
            StatusCode::NOT_MODIFIED,
            [(header::LAST_MODIFIED, update_tag.to_string())],
        )
            .into_response()),
        PassFetch::Fresh(artifact) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, PKPASS_CONTENT_TYPE.to_string()),
                (header::LAST_MODIFIED, artifact.update_tag.to_string()),
            ],
            artifact.bytes.clone(),
        )
            .into_response()),
    }
}

/// GET /v1/devices/:device_id/registrations/:pass_type_id/:serial
async fn registration_status(
    State(state): State<AppState>,
    Path((device_id, pass_type_id, serial)): Path<(String, String, String)>,
) -> Result<StatusCode> {
    if state
        .ledger
        .is_registered(&device_id, &pass_type_id, &serial)
        .await?
    {
        Ok(StatusCode::OK)
    } else {
        Err(AppError::NotFound("registration".to_string()))
    }
}

/// POST /v1/devices/:device_id/registrations/:pass_type_id/:serial
async fn register_device(
    State(state): State<AppState>,
    Path((device_id, pass_type_id, serial)): Path<(String, String, String)>,
    auth: PassAuthorization,
    Json(body): Json<RegisterBody>,
) -> Result<StatusCode> {
    let auth_token = auth
        .0
        .or(body.auth_token)
        .ok_or(AppError::Unauthorized)?;
    let push_token = body
        .push_token
        .ok_or_else(|| AppError::Validation("pushToken is required".to_string()))?;

    let outcome = state
        .ledger
        .register(RegisterRequest {
            device_library_id: device_id,
            pass_type_id,
            serial,
            push_token,
            auth_token,
        })
        .await?;

    Ok(match outcome {
        RegistrationOutcome::Created => StatusCode::CREATED,
        RegistrationOutcome::Confirmed => StatusCode::OK,
    })
}

/// DELETE /v1/devices/:device_id/registrations/:pass_type_id/:serial
async fn unregister_device(
    State(state): State<AppState>,
    Path((device_id, pass_type_id, serial)): Path<(String, String, String)>,
    auth: PassAuthorization,
) -> Result<StatusCode> {
    let token = require_token(auth)?;
    state
        .ledger
        .unregister(&device_id, &pass_type_id, &serial, &token)
        .await?;
    Ok(StatusCode::OK)
}

fn serials_response(changed: ChangedSerials) -> Response {
    match changed.last_updated {
        Some(last_updated) if !changed.is_empty() => Json(SerialNumbersResponse {
            serial_numbers: changed.serials,
            last_updated: last_updated.to_string(),
        })
        .into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    }
}

/// GET /v1/devices/:device_id/registrations/:pass_type_id
async fn updated_serials(
    State(state): State<AppState>,
    Path((device_id, pass_type_id)): Path<(String, String)>,
    Query(query): Query<UpdatedSinceQuery>,
) -> Result<Response> {
    let since = parse_since(&query)?;
    let changed = state
        .updates
        .changed_serials_since(&device_id, &pass_type_id, since)
        .await?;
    Ok(serials_response(changed))
}

/// GET /v1/serialNumbers/:device_id (configured pass type)
async fn updated_serials_default_type(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<UpdatedSinceQuery>,
) -> Result<Response> {
    let since = parse_since(&query)?;
    let changed = state
        .updates
        .changed_serials_since(&device_id, state.updates.pass_type_id(), since)
        .await?;
    Ok(serials_response(changed))
}

/// POST /v1/log
async fn device_log(Json(body): Json<DeviceLogs>) -> StatusCode {
    for line in &body.logs {
        tracing::warn!(device_log = %line, "Wallet device log");
    }
    StatusCode::OK
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/passes/:pass_type_id/:serial", get(get_pass))
        .route(
            "/v1/devices/:device_id/registrations/:pass_type_id/:serial",
            get(registration_status)
                .post(register_device)
                .delete(unregister_device),
        )
        .route(
            "/v1/devices/:device_id/registrations/:pass_type_id",
            get(updated_serials),
        )
        .route(
            "/v1/serialNumbers/:device_id",
            get(updated_serials_default_type),
        )
        .route("/v1/log", post(device_log))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::state::fixtures::{self, PASS_TYPE};
    use crate::models::card::PunchRequest;
    use crate::models::WalletCard;
    use crate::store::CardStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use tower::ServiceExt;

    struct Sent {
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
    }

    async fn send(app: &fixtures::TestApp, request: Request<Body>) -> Sent {
        let response = router()
            .with_state(app.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec();
        Sent {
            status,
            headers,
            body,
        }
    }

    async fn join(app: &fixtures::TestApp) -> WalletCard {
        let (card, _) = app
            .state
            .loyalty
            .create_card(uuid::Uuid::new_v4(), app.program.id)
            .await
            .unwrap();
        card
    }

    fn registration_uri(device: &str, card: &WalletCard) -> String {
        format!(
            "/v1/devices/{}/registrations/{}/{}",
            device,
            PASS_TYPE,
            card.serial_number()
        )
    }

    fn register_request(device: &str, card: &WalletCard, token: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(registration_uri(device, card))
            .header("authorization", format!("ApplePass {}", token))
            .header("content-type", "application/json")
            .body(Body::from(r#"{"pushToken":"push-1"}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_created_then_confirmed() {
        let app = fixtures::app();
        let card = join(&app).await;

        let first = send(&app, register_request("device-1", &card, &card.auth_token)).await;
        assert_eq!(first.status, StatusCode::CREATED);
        let second = send(&app, register_request("device-1", &card, &card.auth_token)).await;
        assert_eq!(second.status, StatusCode::OK);

        let check = send(
            &app,
            Request::builder()
                .uri(registration_uri("device-1", &card))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(check.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_with_wrong_token_is_unauthorized() {
        let app = fixtures::app();
        let card = join(&app).await;

        let sent = send(&app, register_request("device-1", &card, "wrong")).await;
        assert_eq!(sent.status, StatusCode::UNAUTHORIZED);

        let check = send(
            &app,
            Request::builder()
                .uri(registration_uri("device-1", &card))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(check.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_register_accepts_token_in_body() {
        let app = fixtures::app();
        let card = join(&app).await;

        let request = Request::builder()
            .method("POST")
            .uri(registration_uri("device-1", &card))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"pushToken": "push-1", "authToken": card.auth_token})
                    .to_string(),
            ))
            .unwrap();
        assert_eq!(send(&app, request).await.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_register_without_push_token_is_bad_request() {
        let app = fixtures::app();
        let card = join(&app).await;

        let request = Request::builder()
            .method("POST")
            .uri(registration_uri("device-1", &card))
            .header("authorization", format!("ApplePass {}", card.auth_token))
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(send(&app, request).await.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let app = fixtures::app();
        let card = join(&app).await;
        send(&app, register_request("device-1", &card, &card.auth_token)).await;

        for _ in 0..2 {
            let request = Request::builder()
                .method("DELETE")
                .uri(registration_uri("device-1", &card))
                .header("authorization", format!("ApplePass {}", card.auth_token))
                .body(Body::empty())
                .unwrap();
            assert_eq!(send(&app, request).await.status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_get_pass_and_not_modified() {
        let app = fixtures::app();
        let card = join(&app).await;
        let uri = format!("/v1/passes/{}/{}", PASS_TYPE, card.serial_number());

        let fresh = send(
            &app,
            Request::builder()
                .uri(&uri)
                .header("authorization", format!("ApplePass {}", card.auth_token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(fresh.status, StatusCode::OK);
        assert_eq!(fresh.headers[header::CONTENT_TYPE], PKPASS_CONTENT_TYPE);
        assert_eq!(
            fresh.headers[header::LAST_MODIFIED],
            card.update_tag.to_string().as_str()
        );
        assert!(fresh.body.starts_with(b"PK"));

        let cached = send(
            &app,
            Request::builder()
                .uri(&uri)
                .header("authorization", format!("ApplePass {}", card.auth_token))
                .header("if-modified-since", card.update_tag.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(cached.status, StatusCode::NOT_MODIFIED);

        let missing_token = send(
            &app,
            Request::builder().uri(&uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(missing_token.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_serial_numbers_poll() {
        let app = fixtures::app();
        let card = join(&app).await;
        send(&app, register_request("device-1", &card, &card.auth_token)).await;

        let outcome = app
            .store
            .apply_punch(
                card.id,
                PunchRequest {
                    amount: 1,
                    source: "test".to_string(),
                    created_by: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let uri = format!(
            "/v1/devices/device-1/registrations/{}?passesUpdatedSince={}",
            PASS_TYPE, card.update_tag
        );
        let sent = send(&app, Request::builder().uri(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(sent.status, StatusCode::OK);
        let response: SerialNumbersResponse = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(response.serial_numbers, vec![card.serial_number()]);
        assert_eq!(response.last_updated, outcome.card.update_tag.to_string());

        let uri = format!(
            "/v1/serialNumbers/device-1?passesUpdatedSince={}",
            response.last_updated
        );
        let sent = send(&app, Request::builder().uri(&uri).body(Body::empty()).unwrap()).await;
        assert_eq!(sent.status, StatusCode::NO_CONTENT);

        let sent = send(
            &app,
            Request::builder()
                .uri("/v1/serialNumbers/device-1?passesUpdatedSince=yesterday")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(sent.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_device_log_accepted() {
        let app = fixtures::app();
        let request = Request::builder()
            .method("POST")
            .uri("/v1/log")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"logs":["Web service error"]}"#))
            .unwrap();
        assert_eq!(send(&app, request).await.status, StatusCode::OK);
    }
}
