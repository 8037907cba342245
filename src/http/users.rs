use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use super::{ApiError, AppState, AuthUser};
use crate::model::User;
use crate::service::users;

/// GET /api/users/{id}, the caller's own profile only.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(users::get_profile(&state.pool, user.user_id, id).await?))
}
