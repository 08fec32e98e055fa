//! Session middleware: resolves the bearer token to a user id.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{ApiError, AppState};

/// Injected as a request extension by [`require_session`].
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser {
    pub id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: usize,
}

pub async fn require_session(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let user = authenticate(header, state.jwt_secret.as_bytes())?;
    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

fn authenticate(header: Option<&str>, secret: &[u8]) -> Result<AuthenticatedUser, ApiError> {
    let token = header
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map_err(|e| {
        debug!("session token rejected: {:?}", e);
        ApiError::InvalidJwt
    })?;

    Ok(AuthenticatedUser {
        id: data.claims.sub,
    })
}
