//! Registration, login, token refresh, the bearer-token extractor and the
//! auth throttle middleware.

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ApiError, AppState};
use crate::auth::JwtError;
use crate::model::{RefreshTokenRequest, TokenResponse, UserCreateRequest, UserLoginRequest};
use crate::service::users;
use crate::throttle::client_ip;

/// The authenticated caller, taken from `Authorization: Bearer <jwt>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: i64,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("invalid authorization header"))?;

        match state.jwt.validate_token(token) {
            Ok(claims) => Ok(Self {
                user_id: claims.user_id,
            }),
            Err(JwtError::Expired) => Err(ApiError::unauthorized("token expired")),
            Err(err) => {
                debug!(?err, "rejected access token");
                Err(ApiError::unauthorized("invalid token"))
            }
        }
    }
}

/// Per-IP limit on the unauthenticated auth endpoints.
pub async fn throttle(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(peer, request.headers(), state.throttle.trusted_proxies());
    if !state.throttle.check(ip) {
        warn!(%ip, path = %request.uri().path(), "too many auth attempts");
        return ApiError::too_many_requests().into_response();
    }
    next.run(request).await
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UserCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TokenResponse>), ApiError> {
    let Json(req) = payload?;
    let tokens = users::register(&state.pool, &state.jwt, &state.passwords, &req).await?;
    Ok((StatusCode::CREATED, Json(tokens)))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<UserLoginRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = payload?;
    let tokens = users::login(&state.pool, &state.jwt, &state.passwords, &req).await?;
    Ok(Json(tokens))
}

pub async fn refresh(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RefreshTokenRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, ApiError> {
    let Json(req) = payload?;
    let tokens = users::refresh(&state.pool, &state.jwt, &req).await?;
    Ok(Json(tokens))
}
