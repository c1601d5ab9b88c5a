use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use std::convert::Infallible;

use crate::api::state::AppState;
use crate::services::tokens;

/// Authentication error responses
#[derive(Debug)]
pub enum AuthError {
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            AuthError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Authentication required.").into_response()
            }
        }
    }
}

/// Token from an `Authorization: <scheme> <token>` header, for any of `schemes`
fn credential<'a>(headers: &'a HeaderMap, schemes: &[&str]) -> Option<&'a str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();

    if token.is_empty() || !schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
        return None;
    }
    Some(token)
}

/// Middleware that requires the collaborator service token
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let presented = credential(request.headers(), &["Bearer"]).ok_or(AuthError::Unauthorized)?;

    if !tokens::tokens_match(presented, state.config.service_token.expose_secret()) {
        tracing::warn!("Rejected collaborator request with invalid service token");
        return Err(AuthError::Unauthorized);
    }

    Ok(next.run(request).await)
}

/// Pass authentication token sent by devices as `ApplePass <token>`
/// (`Bearer` is accepted too). Absent when the header is missing or malformed.
#[derive(Debug, Clone)]
pub struct PassAuthorization(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for PassAuthorization
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PassAuthorization(
            credential(&parts.headers, &["ApplePass", "Bearer"]).map(str::to_string),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_credential_schemes() {
        assert_eq!(
            credential(&headers("ApplePass abc"), &["ApplePass"]),
            Some("abc")
        );
        assert_eq!(
            credential(&headers("bearer abc"), &["ApplePass", "Bearer"]),
            Some("abc")
        );
        assert_eq!(credential(&headers("Basic abc"), &["ApplePass"]), None);
        assert_eq!(credential(&headers("ApplePass "), &["ApplePass"]), None);
        assert_eq!(credential(&HeaderMap::new(), &["ApplePass"]), None);
    }
}
