use chrono::Utc;
use tracing::{error, info};

use super::{ServiceError, ServiceResult};
use crate::db::{self, Pool, PostFilter};
use crate::model::{validate_comment, Comment, Pagination};

pub async fn create(
    pool: &Pool,
    user_id: i64,
    post_id: i64,
    content: &str,
) -> ServiceResult<Comment> {
    validate_comment(content).map_err(ServiceError::Validation)?;
    ensure_post_published(pool, post_id, ServiceError::PostNotFound).await?;
    db::insert_comment(pool, post_id, user_id, content)
        .await
        .map_err(|err| {
            error!(?err, post_id, user_id, "failed to create comment");
            ServiceError::Database
        })
}

pub async fn get_by_id(pool: &Pool, id: i64) -> ServiceResult<Comment> {
    match db::get_comment(pool, id).await {
        Ok(Some(comment)) => Ok(comment),
        Ok(None) => {
            info!(comment_id = id, "comment not found");
            Err(ServiceError::CommentNotFound)
        }
        Err(err) => {
            error!(?err, comment_id = id, "failed to get comment");
            Err(ServiceError::Database)
        }
    }
}

pub async fn get_by_post(
    pool: &Pool,
    post_id: i64,
    page: Pagination,
) -> ServiceResult<(Vec<Comment>, i64)> {
    ensure_post_published(pool, post_id, ServiceError::PostNotFound).await?;
    let comments = db::get_comments_by_post(pool, post_id, page.limit, page.offset)
        .await
        .map_err(|err| {
            error!(?err, post_id, "failed to fetch comments");
            ServiceError::Database
        })?;
    let total = db::count_comments_by_post(pool, post_id)
        .await
        .map_err(|err| {
            error!(?err, post_id, "failed to count comments");
            ServiceError::Database
        })?;
    Ok((comments, total))
}

/// Edit a comment. `post_id` comes from the route and must match the
/// comment's post.
pub async fn update(
    pool: &Pool,
    post_id: i64,
    id: i64,
    user_id: i64,
    content: &str,
) -> ServiceResult<Comment> {
    validate_comment(content).map_err(ServiceError::Validation)?;
    let mut comment = get_in_post(pool, post_id, id).await?;
    ensure_post_published(pool, comment.post_id, ServiceError::CommentNotFound).await?;
    check_owner(&comment, user_id)?;

    let now = Utc::now();
    match db::update_comment(pool, id, content, now).await {
        Ok(true) => {
            comment.content = content.to_string();
            comment.updated_at = now;
            Ok(comment)
        }
        Ok(false) => Err(ServiceError::CommentNotFound),
        Err(err) => {
            error!(?err, comment_id = id, "failed to update comment");
            Err(ServiceError::Database)
        }
    }
}

pub async fn delete(pool: &Pool, post_id: i64, id: i64, user_id: i64) -> ServiceResult<()> {
    let comment = get_in_post(pool, post_id, id).await?;
    check_owner(&comment, user_id)?;
    match db::delete_comment(pool, id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ServiceError::CommentNotFound),
        Err(err) => {
            error!(?err, comment_id = id, "failed to delete comment");
            Err(ServiceError::Database)
        }
    }
}

async fn get_in_post(pool: &Pool, post_id: i64, id: i64) -> ServiceResult<Comment> {
    let comment = get_by_id(pool, id).await?;
    if comment.post_id != post_id {
        info!(comment_id = id, post_id, "comment belongs to another post");
        return Err(ServiceError::CommentNotFound);
    }
    Ok(comment)
}

async fn ensure_post_published(
    pool: &Pool,
    post_id: i64,
    missing: ServiceError,
) -> ServiceResult<()> {
    match db::get_post(pool, post_id, &PostFilter::published()).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => {
            info!(post_id, "post not found or not published");
            Err(missing)
        }
        Err(err) => {
            error!(?err, post_id, "failed to fetch post");
            Err(ServiceError::Database)
        }
    }
}

fn check_owner(comment: &Comment, user_id: i64) -> ServiceResult<()> {
    if comment.author_id != user_id {
        info!(
            user_id,
            comment_id = comment.id,
            author_id = comment.author_id,
            "user is not the author of comment"
        );
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}
