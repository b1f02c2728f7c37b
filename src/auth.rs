use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::AppState;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hashes on the blocking pool; bcrypt is deliberately slow.
pub async fn hash_password(password: &str, cost: u32) -> AppResult<String> {
    let password = password.to_owned();
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;
    Ok(hash)
}

/// A malformed stored hash counts as a mismatch.
pub async fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    let password = password.to_owned();
    let hash = hash.to_owned();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await?;
    Ok(verified.unwrap_or_else(|e| {
        tracing::warn!("stored password hash could not be verified: {}", e);
        false
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: Uuid,
    pub iat: usize,
    pub exp: usize,
}

/// Issues and checks signed session tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: chrono::Duration,
    pool: DbPool,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl: chrono::Duration, pool: DbPool) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            pool,
        }
    }

    pub fn issue(&self, username: &str) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: username.to_string(),
            jti: Uuid::new_v4(),
            iat: now.timestamp() as usize,
            exp: (now + self.ttl).timestamp() as usize,
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Signature, expiry, then revocation.
    pub async fn verify(&self, token: &str) -> AppResult<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default()).map_err(|e| {
            tracing::debug!("rejected token: {}", e);
            AppError::Unauthorized
        })?;

        if self.is_revoked(&data.claims.jti).await? {
            return Err(AppError::Unauthorized);
        }

        Ok(data.claims)
    }

    /// Records the token id until it would have expired anyway, pruning rows
    /// whose tokens are already dead.
    pub async fn revoke(&self, claims: &Claims) -> AppResult<()> {
        let now = Utc::now();
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp as i64, 0).unwrap_or(now);

        sqlx::query("DELETE FROM revoked_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query("INSERT OR IGNORE INTO revoked_tokens (jti, expires_at) VALUES (?, ?)")
            .bind(claims.jti.to_string())
            .bind(expires_at)
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    async fn is_revoked(&self, jti: &Uuid) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 FROM revoked_tokens WHERE jti = ?")
            .bind(jti.to_string())
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(row.is_some())
    }
}

/// The caller's verified identity. Extracting it is the login check: any
/// handler taking an `AuthUser` rejects anonymous requests with 401.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub username: String,
    pub claims: Claims,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let claims = state.tokens.verify(token).await?;

        Ok(AuthUser {
            username: claims.sub.clone(),
            claims,
        })
    }
}

/// The caller must be the user who owns the resource.
pub fn ensure_correct_user(user: &AuthUser, owner: &str) -> AppResult<()> {
    if user.username == owner {
        Ok(())
    } else {
        tracing::warn!(caller = %user.username, owner, "caller does not own resource");
        Err(AppError::Authorization)
    }
}

/// The caller must be one of the given participants.
pub fn ensure_participant(user: &AuthUser, from_username: &str, to_username: &str) -> AppResult<()> {
    if user.username == from_username || user.username == to_username {
        Ok(())
    } else {
        tracing::warn!(caller = %user.username, "caller is not a participant");
        Err(AppError::Authorization)
    }
}
