use super::model::PostFilter;
use crate::model::{Comment, Post, RefreshToken, User};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

const POST_COLUMNS: &str =
    "id, title, content, author_id, published, publish_at, created_at, updated_at";
const COMMENT_COLUMNS: &str = "id, content, post_id, author_id, created_at, updated_at";
const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL plus full sync; foreign keys drive comment cascades.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory pool with the schema applied. Every pooled
/// connection to `sqlite::memory:` is a separate database, so the pool is
/// pinned to one connection that never expires.
pub async fn init_memory_pool() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    Ok(Post {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        content: row.try_get("content")?,
        author_id: row.try_get("author_id")?,
        published: row.try_get("published")?,
        publish_at: row.try_get::<Option<DateTime<Utc>>, _>("publish_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment> {
    Ok(Comment {
        id: row.try_get("id")?,
        content: row.try_get("content")?,
        post_id: row.try_get("post_id")?,
        author_id: row.try_get("author_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// Users

#[instrument(skip_all)]
pub async fn insert_user_tx(
    tx: &mut Tx<'_>,
    username: &str,
    email: &str,
    password_hash: &str,
) -> Result<User> {
    let now = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO users (username, email, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(username)
    .bind(email)
    .bind(password_hash)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(User {
        id,
        username: username.to_string(),
        email: email.to_string(),
        password_hash: password_hash.to_string(),
        created_at: now,
        updated_at: now,
    })
}

#[instrument(skip_all)]
pub async fn get_user_by_id(pool: &Pool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_user_by_email(pool: &Pool, email: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
        .bind(email)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(user_from_row).transpose()
}

/// True when either the email or the username is already taken.
#[instrument(skip_all)]
pub async fn user_exists(pool: &Pool, email: &str, username: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ? OR username = ?")
            .bind(email)
            .bind(username)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

// Refresh tokens

#[instrument(skip_all)]
pub async fn insert_refresh_token_tx(tx: &mut Tx<'_>, token: &RefreshToken) -> Result<()> {
    sqlx::query(
        "INSERT INTO refresh_tokens (value, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(token.value.to_string())
    .bind(token.user_id)
    .bind(token.expires_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Remove a refresh token and return it, so every token can be used once.
#[instrument(skip_all)]
pub async fn take_refresh_token_tx(
    tx: &mut Tx<'_>,
    value: uuid::Uuid,
) -> Result<Option<RefreshToken>> {
    let row = sqlx::query("DELETE FROM refresh_tokens WHERE value = ? RETURNING user_id, expires_at")
        .bind(value.to_string())
        .fetch_optional(&mut **tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(RefreshToken {
        value,
        user_id: row.try_get("user_id")?,
        expires_at: row.try_get("expires_at")?,
    }))
}

// Posts

fn push_post_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &PostFilter) {
    qb.push(" WHERE 1 = 1");
    if let Some(author_id) = filter.author_id {
        qb.push(" AND author_id = ").push_bind(author_id);
    }
    if let Some(published) = filter.published {
        qb.push(" AND published = ").push_bind(published);
    }
    if let Some(due_before) = filter.due_before {
        qb.push(" AND publish_at IS NOT NULL AND julianday(publish_at) <= julianday(")
            .push_bind(due_before)
            .push(")");
    }
}

#[instrument(skip_all)]
pub async fn insert_post(
    pool: &Pool,
    author_id: i64,
    title: &str,
    content: &str,
    published: bool,
    publish_at: Option<DateTime<Utc>>,
) -> Result<Post> {
    let now = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO posts (title, content, author_id, published, publish_at, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(title)
    .bind(content)
    .bind(author_id)
    .bind(published)
    .bind(publish_at)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to create post")?
    .get("id");
    Ok(Post {
        id,
        title: title.to_string(),
        content: content.to_string(),
        author_id,
        published,
        publish_at,
        created_at: now,
        updated_at: now,
    })
}

#[instrument(skip_all)]
pub async fn get_post(pool: &Pool, id: i64, filter: &PostFilter) -> Result<Option<Post>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {POST_COLUMNS} FROM posts"));
    push_post_filters(&mut qb, filter);
    qb.push(" AND id = ").push_bind(id);
    let row = qb.build().fetch_optional(pool).await?;
    row.as_ref().map(post_from_row).transpose()
}

/// Newest posts first.
#[instrument(skip_all)]
pub async fn get_posts(
    pool: &Pool,
    filter: &PostFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<Post>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {POST_COLUMNS} FROM posts"));
    push_post_filters(&mut qb, filter);
    qb.push(" ORDER BY julianday(created_at) DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(post_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_posts(pool: &Pool, filter: &PostFilter) -> Result<i64> {
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM posts");
    push_post_filters(&mut qb, filter);
    let count = qb.build_query_scalar::<i64>().fetch_one(pool).await?;
    Ok(count)
}

/// Unpublished posts with `publish_at <= now`, oldest due first.
#[instrument(skip_all)]
pub async fn fetch_due_posts(
    pool: &Pool,
    now: DateTime<Utc>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Post>> {
    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {POST_COLUMNS} FROM posts"));
    push_post_filters(&mut qb, &PostFilter::due(now));
    qb.push(" ORDER BY julianday(publish_at) ASC, id ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(post_from_row).collect()
}

/// Persist the editable fields of a post. Returns false when the row is gone.
#[instrument(skip_all)]
pub async fn update_post(pool: &Pool, post: &Post) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE posts SET title = ?, content = ?, publish_at = ?, published = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&post.title)
    .bind(&post.content)
    .bind(post.publish_at)
    .bind(post.published)
    .bind(post.updated_at)
    .bind(post.id)
    .execute(pool)
    .await
    .context("failed to update post")?;
    Ok(res.rows_affected() > 0)
}

/// Set `published = true`. Repeating it on a published post is a no-op
/// apart from the timestamp; returns false only when the row is gone.
#[instrument(skip_all)]
pub async fn mark_post_published(pool: &Pool, id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query("UPDATE posts SET published = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to publish post")?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_post(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete post")?;
    Ok(res.rows_affected() > 0)
}

// Comments

#[instrument(skip_all)]
pub async fn insert_comment(
    pool: &Pool,
    post_id: i64,
    author_id: i64,
    content: &str,
) -> Result<Comment> {
    let now = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO comments (content, post_id, author_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(content)
    .bind(post_id)
    .bind(author_id)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to create comment")?
    .get("id");
    Ok(Comment {
        id,
        content: content.to_string(),
        post_id,
        author_id,
        created_at: now,
        updated_at: now,
    })
}

#[instrument(skip_all)]
pub async fn get_comment(pool: &Pool, id: i64) -> Result<Option<Comment>> {
    let row = sqlx::query(&format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(comment_from_row).transpose()
}

/// Oldest comments first, so threads read top to bottom.
#[instrument(skip_all)]
pub async fn get_comments_by_post(
    pool: &Pool,
    post_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<Comment>> {
    let rows = sqlx::query(&format!(
        "SELECT {COMMENT_COLUMNS} FROM comments WHERE post_id = ? ORDER BY julianday(created_at) ASC, id ASC LIMIT ? OFFSET ?"
    ))
    .bind(post_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(comment_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_comments_by_post(pool: &Pool, post_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE post_id = ?")
        .bind(post_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn update_comment(
    pool: &Pool,
    id: i64,
    content: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query("UPDATE comments SET content = ?, updated_at = ? WHERE id = ?")
        .bind(content)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update comment")?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn delete_comment(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM comments WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete comment")?;
    Ok(res.rows_affected() > 0)
}
