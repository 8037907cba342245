use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::{ServiceError, ServiceResult};
use crate::auth::{JwtManager, PasswordError, PasswordManager};
use crate::db::{self, Pool, Tx};
use crate::model::{
    RefreshToken, RefreshTokenRequest, TokenResponse, User, UserCreateRequest, UserLoginRequest,
};

/// Create an account and sign the caller in.
pub async fn register(
    pool: &Pool,
    jwt: &JwtManager,
    passwords: &PasswordManager,
    req: &UserCreateRequest,
) -> ServiceResult<TokenResponse> {
    req.validate().map_err(ServiceError::Validation)?;

    let taken = db::user_exists(pool, &req.email, &req.username)
        .await
        .map_err(|err| {
            error!(?err, "failed to check user existence");
            ServiceError::Database
        })?;
    if taken {
        return Err(ServiceError::UserAlreadyExists);
    }

    let hash = passwords
        .hash_password(&req.password)
        .await
        .map_err(|err| match err {
            PasswordError::Hash(msg) => {
                error!(error = %msg, "failed to hash a password");
                ServiceError::PasswordHash
            }
            weak => ServiceError::WeakPassword(weak.to_string()),
        })?;

    let mut tx = begin(pool).await?;
    let user = match db::insert_user_tx(&mut tx, req.username.trim(), &req.email, &hash).await {
        Ok(user) => user,
        Err(err) if is_unique_violation(&err) => return Err(ServiceError::UserAlreadyExists),
        Err(err) => {
            error!(?err, "failed to create a user");
            return Err(ServiceError::Database);
        }
    };
    let pair = issue_token_pair(&mut tx, jwt, user.id).await?;
    commit(tx).await?;

    info!(user_id = user.id, "user registered");
    Ok(pair.into_response(user))
}

pub async fn login(
    pool: &Pool,
    jwt: &JwtManager,
    passwords: &PasswordManager,
    req: &UserLoginRequest,
) -> ServiceResult<TokenResponse> {
    req.validate().map_err(ServiceError::Validation)?;

    let user = match db::get_user_by_email(pool, &req.email).await {
        Ok(Some(user)) => user,
        // do not reveal whether the email exists
        Ok(None) => return Err(ServiceError::InvalidCredentials),
        Err(err) => {
            error!(?err, "failed to fetch a user");
            return Err(ServiceError::Database);
        }
    };

    if !passwords.check_password(&req.password, &user.password_hash).await {
        return Err(ServiceError::InvalidCredentials);
    }

    let mut tx = begin(pool).await?;
    let pair = issue_token_pair(&mut tx, jwt, user.id).await?;
    commit(tx).await?;
    Ok(pair.into_response(user))
}

/// Exchange a refresh token for a new pair. The presented token is consumed
/// whether or not it is still valid.
pub async fn refresh(
    pool: &Pool,
    jwt: &JwtManager,
    req: &RefreshTokenRequest,
) -> ServiceResult<TokenResponse> {
    let value = uuid::Uuid::parse_str(req.refresh_token.trim())
        .map_err(|_| ServiceError::InvalidRefreshToken)?;

    let mut tx = begin(pool).await?;
    let token = match db::take_refresh_token_tx(&mut tx, value).await {
        Ok(Some(token)) => token,
        Ok(None) => return Err(ServiceError::InvalidRefreshToken),
        Err(err) => {
            error!(?err, "failed to fetch a refresh token");
            return Err(ServiceError::Database);
        }
    };

    if Utc::now() > token.expires_at {
        if let Err(err) = tx.commit().await {
            warn!(?err, "failed to delete expired refresh token");
        }
        return Err(ServiceError::RefreshTokenExpired);
    }

    let pair = issue_token_pair(&mut tx, jwt, token.user_id).await?;
    commit(tx).await?;

    let user = get_by_id(pool, token.user_id).await?;
    Ok(pair.into_response(user))
}

pub async fn get_by_id(pool: &Pool, id: i64) -> ServiceResult<User> {
    match db::get_user_by_id(pool, id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(ServiceError::UserNotFound),
        Err(err) => {
            error!(?err, user_id = id, "failed to fetch a user");
            Err(ServiceError::Database)
        }
    }
}

/// Profiles are private: only the owner may read one.
pub async fn get_profile(pool: &Pool, actor_id: i64, id: i64) -> ServiceResult<User> {
    if actor_id != id {
        return Err(ServiceError::Forbidden);
    }
    get_by_id(pool, id).await
}

struct TokenPair {
    access_token: String,
    access_expiry: DateTime<Utc>,
    refresh: RefreshToken,
}

impl TokenPair {
    fn into_response(self, user: User) -> TokenResponse {
        TokenResponse {
            access_token: self.access_token,
            access_token_expiry: self.access_expiry,
            refresh_token: self.refresh.value.to_string(),
            refresh_token_expiry: self.refresh.expires_at,
            user,
        }
    }
}

async fn issue_token_pair(tx: &mut Tx<'_>, jwt: &JwtManager, user_id: i64) -> ServiceResult<TokenPair> {
    let (access_token, access_expiry) = jwt.generate_token(user_id).map_err(|err| {
        error!(?err, user_id, "failed to sign access token");
        ServiceError::TokenGeneration
    })?;

    let refresh = RefreshToken {
        value: uuid::Uuid::new_v4(),
        user_id,
        expires_at: Utc::now() + jwt.refresh_ttl(),
    };
    db::insert_refresh_token_tx(tx, &refresh)
        .await
        .map_err(|err| {
            error!(?err, user_id, "failed to store refresh token");
            ServiceError::Database
        })?;

    Ok(TokenPair {
        access_token,
        access_expiry,
        refresh,
    })
}

async fn begin(pool: &Pool) -> ServiceResult<Tx<'static>> {
    pool.begin().await.map_err(|err| {
        error!(?err, "failed to begin transaction");
        ServiceError::Database
    })
}

async fn commit(tx: Tx<'_>) -> ServiceResult<()> {
    tx.commit().await.map_err(|err| {
        error!(?err, "failed to commit transaction");
        ServiceError::Database
    })
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn managers() -> (JwtManager, PasswordManager) {
        (
            JwtManager::new(
                "secret",
                chrono::Duration::minutes(5),
                chrono::Duration::hours(24),
            ),
            PasswordManager::new(config::Password::default()),
        )
    }

    fn signup(name: &str) -> UserCreateRequest {
        UserCreateRequest {
            username: name.into(),
            email: format!("{name}@example.com"),
            password: "Secret1!".into(),
        }
    }

    #[tokio::test]
    async fn expired_refresh_token_is_consumed() {
        let pool = db::init_memory_pool().await.unwrap();
        let (jwt, passwords) = managers();
        let tokens = register(&pool, &jwt, &passwords, &signup("dave")).await.unwrap();

        let stale = RefreshToken {
            value: uuid::Uuid::new_v4(),
            user_id: tokens.user.id,
            expires_at: Utc::now() - chrono::Duration::minutes(1),
        };
        let mut tx = pool.begin().await.unwrap();
        db::insert_refresh_token_tx(&mut tx, &stale).await.unwrap();
        tx.commit().await.unwrap();

        let req = RefreshTokenRequest {
            refresh_token: stale.value.to_string(),
        };
        assert_eq!(
            refresh(&pool, &jwt, &req).await.unwrap_err(),
            ServiceError::RefreshTokenExpired
        );
        assert_eq!(
            refresh(&pool, &jwt, &req).await.unwrap_err(),
            ServiceError::InvalidRefreshToken
        );
    }

    #[tokio::test]
    async fn access_token_names_the_user() {
        let pool = db::init_memory_pool().await.unwrap();
        let (jwt, passwords) = managers();
        let tokens = register(&pool, &jwt, &passwords, &signup("erin")).await.unwrap();
        let claims = jwt.validate_token(&tokens.access_token).unwrap();
        assert_eq!(claims.user_id, tokens.user.id);

        assert_eq!(
            register(&pool, &jwt, &passwords, &signup("erin")).await.unwrap_err(),
            ServiceError::UserAlreadyExists
        );
    }

    #[tokio::test]
    async fn profile_requires_owner() {
        let pool = db::init_memory_pool().await.unwrap();
        assert_eq!(
            get_profile(&pool, 1, 2).await.unwrap_err(),
            ServiceError::Forbidden
        );
        assert_eq!(
            get_profile(&pool, 7, 7).await.unwrap_err(),
            ServiceError::UserNotFound
        );
    }
}
