use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

use super::{ApiError, AppState, AuthUser, PageQuery};
use crate::model::{Pagination, PaginatedResponse, Post, PostCreateRequest, PostUpdateRequest};
use crate::service::posts;

#[derive(Debug, Default, Deserialize)]
pub struct PostListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub author: Option<i64>,
}

type PostPage = Json<PaginatedResponse<Vec<Post>>>;

/// GET /api/posts
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PostListQuery>,
) -> Result<PostPage, ApiError> {
    let page = Pagination::new(query.limit, query.offset).map_err(ApiError::bad_request)?;
    let (data, total) = match query.author {
        Some(author_id) => posts::get_by_author(&state.pool, author_id, page).await?,
        None => posts::get_all(&state.pool, page).await?,
    };
    Ok(Json(PaginatedResponse::new(data, page, total)))
}

/// GET /api/posts/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Post>, ApiError> {
    Ok(Json(posts::get_by_id(&state.pool, id).await?))
}

/// POST /api/posts
pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    payload: Result<Json<PostCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Post>), ApiError> {
    let Json(req) = payload?;
    let post = posts::create(&state.pool, user.user_id, &req).await?;
    Ok((StatusCode::CREATED, Json(post)))
}

/// PUT /api/posts/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
    payload: Result<Json<PostUpdateRequest>, JsonRejection>,
) -> Result<Json<Post>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(posts::update(&state.pool, id, user.user_id, &req).await?))
}

/// DELETE /api/posts/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    posts::delete(&state.pool, id, user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/delayed
pub async fn list_delayed(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<PageQuery>,
) -> Result<PostPage, ApiError> {
    let page = query.pagination()?;
    let (data, total) = posts::get_delayed(&state.pool, user.user_id, page).await?;
    Ok(Json(PaginatedResponse::new(data, page, total)))
}

/// GET /api/delayed/{id}
pub async fn get_delayed(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<Post>, ApiError> {
    Ok(Json(
        posts::get_delayed_by_id(&state.pool, user.user_id, id).await?,
    ))
}
