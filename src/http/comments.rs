use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use super::{ApiError, AppState, AuthUser, PageQuery};
use crate::model::{Comment, CommentCreateRequest, CommentUpdateRequest, PaginatedResponse};
use crate::service::comments;

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(post_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PaginatedResponse<Vec<Comment>>>, ApiError> {
    let page = query.pagination()?;
    let (data, total) = comments::get_by_post(&state.pool, post_id, page).await?;
    Ok(Json(PaginatedResponse::new(data, page, total)))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(post_id): Path<i64>,
    payload: Result<Json<CommentCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Comment>), ApiError> {
    let Json(req) = payload?;
    let comment = comments::create(&state.pool, user.user_id, post_id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((post_id, comment_id)): Path<(i64, i64)>,
    payload: Result<Json<CommentUpdateRequest>, JsonRejection>,
) -> Result<Json<Comment>, ApiError> {
    let Json(req) = payload?;
    let comment =
        comments::update(&state.pool, post_id, comment_id, user.user_id, &req.content).await?;
    Ok(Json(comment))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((post_id, comment_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    comments::delete(&state.pool, post_id, comment_id, user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
