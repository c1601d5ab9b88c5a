use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::api::middleware::auth::require_service_token;
use crate::api::state::AppState;
use crate::api::wallet::PKPASS_CONTENT_TYPE;
use crate::error::{AppError, Result};
use crate::models::card::{PunchRequest, RedeemRequest};
use crate::models::WalletCard;

const DEFAULT_PUNCH_SOURCE: &str = "api";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: Uuid,
    pub program_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchBody {
    pub amount: Option<i32>,
    pub source: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemBody {
    pub credits: Option<i32>,
    pub created_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardResponse {
    pub id: Uuid,
    pub serial_number: String,
    pub program_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub current_punches: i32,
    pub reward_credits: i32,
    pub lifetime_punches: i32,
    pub lifetime_rewards: i32,
    pub update_tag: i64,
    pub expires_at: Option<String>,
    pub pass_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewards_earned: Option<i32>,
}

impl CardResponse {
    fn new(card: WalletCard, state: &AppState) -> Self {
        Self {
            serial_number: card.serial_number(),
            pass_url: format!(
                "{}/api/cards/{}/pass",
                state.config.base_url.trim_end_matches('/'),
                card.id
            ),
            id: card.id,
            program_id: card.program_id,
            user_id: card.user_id,
            status: card.status.as_str().to_string(),
            current_punches: card.current_punches,
            reward_credits: card.reward_credits,
            lifetime_punches: card.lifetime_punches,
            lifetime_rewards: card.lifetime_rewards,
            update_tag: card.update_tag,
            expires_at: card.expires_at.map(|t| t.to_rfc3339()),
            rewards_earned: None,
        }
    }
}

/// JSON body that may be omitted entirely; an empty body means all defaults.
/// Anything else must be well-formed JSON sent as `application/json`.
fn optional_json<T: DeserializeOwned + Default>(headers: &HeaderMap, body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(AppError::Validation(
            "Request body must be sent as application/json".to_string(),
        ));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid request body: {}", e)))
}

/// Join flow: the user's active card for the program, created on first call
async fn join(
    State(state): State<AppState>,
    Json(body): Json<JoinRequest>,
) -> Result<(StatusCode, Json<CardResponse>)> {
    let (card, created) = state
        .loyalty
        .create_card(body.user_id, body.program_id)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(CardResponse::new(card, &state))))
}

async fn get_card(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> Result<Json<CardResponse>> {
    let card = state.loyalty.get_card(card_id).await?;
    Ok(Json(CardResponse::new(card, &state)))
}

async fn download_pass(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
) -> Result<Response> {
    let artifact = state.updates.current_pass(card_id).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, PKPASS_CONTENT_TYPE.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.pkpass\"", artifact.serial),
            ),
            (header::LAST_MODIFIED, artifact.update_tag.to_string()),
        ],
        artifact.bytes.clone(),
    )
        .into_response())
}

async fn punch(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CardResponse>> {
    let body: PunchBody = optional_json(&headers, &body)?;
    let outcome = state
        .loyalty
        .record_punch(
            card_id,
            PunchRequest {
                amount: body.amount.unwrap_or(1),
                source: body
                    .source
                    .unwrap_or_else(|| DEFAULT_PUNCH_SOURCE.to_string()),
                created_by: body.created_by,
            },
        )
        .await?;

    let mut response = CardResponse::new(outcome.card, &state);
    response.rewards_earned = Some(outcome.rewards_earned);
    Ok(Json(response))
}

async fn redeem(
    State(state): State<AppState>,
    Path(card_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CardResponse>> {
    let body: RedeemBody = optional_json(&headers, &body)?;
    let card = state
        .loyalty
        .record_redemption(
            card_id,
            RedeemRequest {
                credits: body.credits.unwrap_or(1),
                created_by: body.created_by,
            },
        )
        .await?;

    Ok(Json(CardResponse::new(card, &state)))
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/cards", post(join))
        .route("/api/cards/:card_id", get(get_card))
        .route("/api/cards/:card_id/pass", get(download_pass))
        .route("/api/cards/:card_id/punches", post(punch))
        .route("/api/cards/:card_id/redemptions", post(redeem))
        .route_layer(middleware::from_fn_with_state(state, require_service_token))
}
