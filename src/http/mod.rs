//! HTTP surface: shared state, routing and handlers.

pub mod auth;
pub mod comments;
pub mod error;
pub mod health;
pub mod posts;
pub mod users;

use axum::routing::{get, post, put};
use axum::{middleware, Router};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use auth::AuthUser;
pub use error::ApiError;

use crate::auth::{JwtManager, PasswordManager};
use crate::config::Config;
use crate::db::Pool;
use crate::model::Pagination;
use crate::scheduler::SchedulerStats;
use crate::throttle::AuthThrottle;

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub pool: Pool,
    pub jwt: JwtManager,
    pub passwords: PasswordManager,
    pub throttle: AuthThrottle,
    pub scheduler: Arc<SchedulerStats>,
}

impl AppState {
    pub fn new(
        pool: Pool,
        cfg: &Config,
        throttle: AuthThrottle,
        scheduler: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            pool,
            jwt: JwtManager::from_config(&cfg.jwt),
            passwords: PasswordManager::new(cfg.password.clone()),
            throttle,
            scheduler,
        }
    }
}

/// `?limit=&offset=` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageQuery {
    pub fn pagination(&self) -> Result<Pagination, ApiError> {
        Pagination::new(self.limit, self.offset).map_err(ApiError::bad_request)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let auth_routes = Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .route("/api/refresh", post(auth::refresh))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::throttle,
        ));

    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/users/{id}", get(users::get_user))
        .route("/api/posts", get(posts::list).post(posts::create))
        .route(
            "/api/posts/{id}",
            get(posts::get).put(posts::update).delete(posts::delete),
        )
        .route("/api/delayed", get(posts::list_delayed))
        .route("/api/delayed/{id}", get(posts::get_delayed))
        .route(
            "/api/posts/{id}/comments",
            get(comments::list).post(comments::create),
        )
        .route(
            "/api/posts/{id}/comments/{comment_id}",
            put(comments::update).delete(comments::delete),
        )
        .merge(auth_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
