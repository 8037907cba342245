use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_LIMIT: i64 = 10;
pub const MAX_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: i64,
    pub published: bool,
    pub publish_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// A post scheduled strictly in the future stays hidden; anything else
    /// (no date, zero date, past date) is visible right away.
    pub fn should_publish_now(publish_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        publish_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: i64,
    pub content: String,
    pub post_id: i64,
    pub author_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshToken {
    pub value: uuid::Uuid,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

// Requests

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreateRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl UserCreateRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        let name_len = self.username.trim().chars().count();
        if !(3..=32).contains(&name_len) {
            return Err("username must be 3-32 characters");
        }
        validate_email(&self.email)?;
        if self.password.is_empty() {
            return Err("password is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLoginRequest {
    pub email: String,
    pub password: String,
}

impl UserLoginRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        validate_email(&self.email)?;
        if self.password.is_empty() {
            return Err("password is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCreateRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub publish_at: Option<DateTime<Utc>>,
}

impl PostCreateRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        validate_title(&self.title)?;
        if self.content.trim().is_empty() {
            return Err("content must be non-empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostUpdateRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub publish_at: Option<DateTime<Utc>>,
}

impl PostUpdateRequest {
    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(content) = &self.content {
            if content.trim().is_empty() {
                return Err("content must be non-empty");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentCreateRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentUpdateRequest {
    pub content: String,
}

pub fn validate_comment(content: &str) -> Result<(), &'static str> {
    let len = content.trim().chars().count();
    if len == 0 || len > 2000 {
        return Err("content must be 1-2000 characters");
    }
    Ok(())
}

fn validate_title(title: &str) -> Result<(), &'static str> {
    let len = title.trim().chars().count();
    if len == 0 || len > 200 {
        return Err("title must be 1-200 characters");
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), &'static str> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err("email is invalid");
    };
    if local.is_empty() || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err("email is invalid");
    }
    Ok(())
}

// Responses

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub access_token_expiry: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_token_expiry: DateTime<Utc>,
    pub user: User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Result<Self, &'static str> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = offset.unwrap_or(0);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err("limit must be between 1 and 100");
        }
        if offset < 0 {
            return Err("offset must be >= 0");
        }
        Ok(Self { limit, offset })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: T,
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: T, page: Pagination, total: i64) -> Self {
        Self {
            data,
            limit: page.limit,
            offset: page.offset,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn publish_rule() {
        let now = Utc::now();
        assert!(Post::should_publish_now(None, now));
        assert!(Post::should_publish_now(Some(now - Duration::seconds(1)), now));
        assert!(Post::should_publish_now(Some(now), now));
        assert!(Post::should_publish_now(DateTime::from_timestamp(0, 0), now));
        assert!(!Post::should_publish_now(Some(now + Duration::hours(1)), now));
    }

    #[test]
    fn pagination_bounds() {
        assert_eq!(Pagination::new(None, None).unwrap(), Pagination::default());
        assert_eq!(
            Pagination::new(Some(100), Some(5)).unwrap(),
            Pagination { limit: 100, offset: 5 }
        );
        assert!(Pagination::new(Some(0), None).is_err());
        assert!(Pagination::new(Some(101), None).is_err());
        assert!(Pagination::new(None, Some(-1)).is_err());
    }

    #[test]
    fn request_validation() {
        let ok = UserCreateRequest {
            username: "tester".into(),
            email: "tester@example.com".into(),
            password: "Passw0rd!".into(),
        };
        assert!(ok.validate().is_ok());

        let bad_email = UserCreateRequest {
            email: "nope".into(),
            ..ok.clone()
        };
        assert!(bad_email.validate().is_err());

        let short_name = UserCreateRequest {
            username: "ab".into(),
            ..ok
        };
        assert!(short_name.validate().is_err());

        let empty_title = PostCreateRequest {
            title: "  ".into(),
            content: "body".into(),
            publish_at: None,
        };
        assert!(empty_title.validate().is_err());
        assert!(PostUpdateRequest::default().validate().is_ok());
        assert!(validate_comment("").is_err());
        assert!(validate_comment("nice").is_ok());
    }

    #[test]
    fn user_serialization_hides_hash() {
        let user = User {
            id: 1,
            username: "u".into(),
            email: "u@example.com".into(),
            password_hash: "secret".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());
    }
}
