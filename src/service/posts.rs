use chrono::Utc;
use tracing::{error, info};

use super::{ServiceError, ServiceResult};
use crate::db::{self, Pool, PostFilter};
use crate::model::{Pagination, Post, PostCreateRequest, PostUpdateRequest};

pub async fn create(pool: &Pool, user_id: i64, req: &PostCreateRequest) -> ServiceResult<Post> {
    req.validate().map_err(ServiceError::Validation)?;
    let published = Post::should_publish_now(req.publish_at, Utc::now());
    db::insert_post(
        pool,
        user_id,
        &req.title,
        &req.content,
        published,
        req.publish_at,
    )
    .await
    .map_err(|err| {
        error!(?err, user_id, "failed to create post");
        ServiceError::Database
    })
}

/// A published post by id; unpublished posts are indistinguishable from
/// missing ones.
pub async fn get_by_id(pool: &Pool, id: i64) -> ServiceResult<Post> {
    fetch(pool, id, &PostFilter::published()).await
}

pub async fn get_all(pool: &Pool, page: Pagination) -> ServiceResult<(Vec<Post>, i64)> {
    list(pool, &PostFilter::published(), page).await
}

pub async fn get_by_author(
    pool: &Pool,
    author_id: i64,
    page: Pagination,
) -> ServiceResult<(Vec<Post>, i64)> {
    list(pool, &PostFilter::published().by_author(author_id), page).await
}

/// The caller's own posts still waiting for publication.
pub async fn get_delayed(
    pool: &Pool,
    user_id: i64,
    page: Pagination,
) -> ServiceResult<(Vec<Post>, i64)> {
    list(pool, &delayed_filter(user_id), page).await
}

pub async fn get_delayed_by_id(pool: &Pool, user_id: i64, post_id: i64) -> ServiceResult<Post> {
    fetch(pool, post_id, &delayed_filter(user_id)).await
}

pub async fn update(
    pool: &Pool,
    id: i64,
    user_id: i64,
    req: &PostUpdateRequest,
) -> ServiceResult<Post> {
    req.validate().map_err(ServiceError::Validation)?;
    let mut post = fetch(pool, id, &PostFilter::default()).await?;
    check_owner(&post, user_id)?;

    let mut updated = false;
    if let Some(title) = req.title.as_ref().filter(|t| **t != post.title) {
        post.title = title.clone();
        updated = true;
    }
    if let Some(content) = req.content.as_ref().filter(|c| **c != post.content) {
        post.content = content.clone();
        updated = true;
    }
    if let Some(publish_at) = req.publish_at {
        let now = Utc::now();
        post.publish_at = Some(publish_at);
        post.published = Post::should_publish_now(post.publish_at, now);
        updated = true;
    }

    if !updated {
        return Ok(post);
    }

    post.updated_at = Utc::now();
    match db::update_post(pool, &post).await {
        Ok(true) => Ok(post),
        Ok(false) => Err(ServiceError::PostNotFound),
        Err(err) => {
            error!(?err, post_id = id, "failed to update post");
            Err(ServiceError::Database)
        }
    }
}

pub async fn delete(pool: &Pool, id: i64, user_id: i64) -> ServiceResult<()> {
    let post = fetch(pool, id, &PostFilter::default()).await?;
    check_owner(&post, user_id)?;
    match db::delete_post(pool, id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ServiceError::PostNotFound),
        Err(err) => {
            error!(?err, post_id = id, "failed to delete post");
            Err(ServiceError::Database)
        }
    }
}

fn delayed_filter(user_id: i64) -> PostFilter {
    PostFilter {
        author_id: Some(user_id),
        published: Some(false),
        due_before: None,
    }
}

async fn fetch(pool: &Pool, id: i64, filter: &PostFilter) -> ServiceResult<Post> {
    match db::get_post(pool, id, filter).await {
        Ok(Some(post)) => Ok(post),
        Ok(None) => {
            info!(post_id = id, "post not found");
            Err(ServiceError::PostNotFound)
        }
        Err(err) => {
            error!(?err, post_id = id, "failed to fetch post");
            Err(ServiceError::Database)
        }
    }
}

async fn list(
    pool: &Pool,
    filter: &PostFilter,
    page: Pagination,
) -> ServiceResult<(Vec<Post>, i64)> {
    let posts = db::get_posts(pool, filter, page.limit, page.offset)
        .await
        .map_err(|err| {
            error!(?err, limit = page.limit, offset = page.offset, "failed to fetch posts");
            ServiceError::Database
        })?;
    let total = db::count_posts(pool, filter).await.map_err(|err| {
        error!(?err, "failed to count posts");
        ServiceError::Database
    })?;
    Ok((posts, total))
}

fn check_owner(post: &Post, user_id: i64) -> ServiceResult<()> {
    if post.author_id != user_id {
        info!(user_id, post_id = post.id, "user is not the author of post");
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}
