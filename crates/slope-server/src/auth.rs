use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Deserialize;
use tracing::debug;

use slope_types::api::Claims;
use slope_types::models::Principal;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    /// WebSocket clients cannot always set headers, so the token may ride
    /// in the query string instead.
    pub access_token: Option<String>,
}

/// Sign an access token for `principal`. The identity provider does this
/// in production; the server only needs it for tooling and tests.
pub fn issue_token(secret: &str, principal: &Principal, ttl: Duration) -> anyhow::Result<String> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH)? + ttl;
    let claims = Claims {
        sub: principal.id,
        email: principal.email.clone(),
        exp: exp.as_secs() as usize,
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}

pub fn verify_token(secret: &str, token: &str) -> Result<Principal, ApiError> {
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default())
        .map_err(|e| {
            debug!("Rejected access token: {}", e);
            ApiError::Unauthenticated
        })?;

    Ok(Principal {
        id: data.claims.sub,
        email: data.claims.email,
    })
}

/// Validate the bearer token (header first, then `access_token`) and attach
/// the [`Principal`] to the request.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<TokenQuery>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = match (&bearer, &query.access_token) {
        (Some(TypedHeader(authorization)), _) => authorization.token(),
        (None, Some(token)) => token.as_str(),
        (None, None) => return Err(ApiError::Unauthenticated),
    };

    let principal = verify_token(&state.jwt_secret, token)?;
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn issued_tokens_verify() {
        let rider = Principal {
            id: Uuid::new_v4(),
            email: Some("rider@slope.test".into()),
        };
        let token = issue_token("secret", &rider, Duration::from_secs(60)).unwrap();
        assert_eq!(verify_token("secret", &token).unwrap(), rider);
        assert!(matches!(verify_token("other", &token), Err(ApiError::Unauthenticated)));
        assert!(matches!(verify_token("secret", "garbage"), Err(ApiError::Unauthenticated)));
    }
}
