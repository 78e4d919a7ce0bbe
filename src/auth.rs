//! User accounts, password hashing, and signed bearer tokens.
//!
//! Passwords are stored as PBKDF2-HMAC-SHA256 digests:
//!
//! ```text
//! pbkdf2-sha256$<rounds>$<salt hex>$<hash hex>
//! ```
//!
//! Access tokens are `base64url(claims json) "." hex(hmac-sha256)`, where
//! the HMAC covers the encoded claims. Claims carry the user id, email, and
//! an expiry in Unix seconds.

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

const HASH_SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Incorrect email or password")]
    InvalidCredentials,
    #[error("Email already registered")]
    EmailTaken,
    #[error("{0}")]
    InvalidInput(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    Expired,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

// ============ Password hashing ============

pub fn hash_password(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive(password, &salt, rounds);
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        rounds,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// Check `password` against a stored hash. Malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, rounds, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != HASH_SCHEME {
        return false;
    }
    let (Ok(rounds), Ok(salt), Ok(expected)) =
        (rounds.parse::<u32>(), hex::decode(salt), hex::decode(expected))
    else {
        return false;
    };
    if rounds == 0 {
        return false;
    }

    let actual = derive(password, &salt, rounds);
    constant_time_eq(&actual, &expected)
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

fn dummy_hash(rounds: u32) -> String {
    format!(
        "{}${}${}${}",
        HASH_SCHEME,
        rounds.max(1),
        hex::encode([0u8; SALT_LEN]),
        hex::encode([0u8; HASH_LEN])
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============ Tokens ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub sub: i64,
    pub email: String,
    pub exp: i64,
}

pub struct TokenSigner {
    secret: Vec<u8>,
    ttl_minutes: i64,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>, ttl_minutes: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_minutes,
        }
    }

    /// Secret from `RAGNOTE_AUTH_SECRET`, then `auth.secret`. Without
    /// either, a random secret is generated and tokens do not survive a
    /// restart.
    pub fn from_config(config: &AuthConfig) -> Self {
        let secret = std::env::var("RAGNOTE_AUTH_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| config.secret.clone())
            .map(String::into_bytes)
            .unwrap_or_else(|| {
                tracing::warn!(
                    "no auth secret configured; tokens will be invalidated on restart"
                );
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            });
        Self::new(secret, config.token_ttl_minutes)
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_minutes.saturating_mul(60)
    }

    /// Issue a token for a user. Returns the token and its lifetime in seconds.
    pub fn issue(&self, user_id: i64, email: &str) -> Result<(String, i64)> {
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            exp: chrono::Utc::now().timestamp().saturating_add(self.ttl_seconds()),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = hex::encode(self.mac(payload.as_bytes()).finalize().into_bytes());
        Ok((format!("{}.{}", payload, signature), self.ttl_seconds()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::InvalidToken)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::InvalidToken)?;

        self.mac(payload.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken)?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| AuthError::InvalidToken)?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac
    }
}

// ============ Accounts ============

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::InvalidInput("A valid email is required".to_string()));
    }
    Ok(email)
}

/// Create an account. Returns the new user id.
pub async fn register(
    pool: &SqlitePool,
    email: &str,
    password: &str,
    rounds: u32,
) -> Result<i64, AuthError> {
    let email = normalize_email(email)?;
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?;
    if exists.is_some() {
        return Err(AuthError::EmailTaken);
    }

    let password_hash = hash_password(password, rounds);
    let result = sqlx::query("INSERT INTO users (email, password_hash, created_at) VALUES (?, ?, ?)")
        .bind(&email)
        .bind(&password_hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await;

    match result {
        Ok(done) => {
            tracing::info!(user_id = done.last_insert_rowid(), "user registered");
            Ok(done.last_insert_rowid())
        }
        // lost a race with a concurrent registration
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AuthError::EmailTaken),
        Err(e) => Err(e.into()),
    }
}

/// Check credentials and issue a token. `rounds` is the configured KDF cost,
/// spent on a dummy hash when the email is unknown.
pub async fn login(
    pool: &SqlitePool,
    signer: &TokenSigner,
    email: &str,
    password: &str,
    rounds: u32,
) -> Result<LoginResponse, AuthError> {
    let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;

    let row = sqlx::query("SELECT id, password_hash FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        // unknown emails pay the same KDF cost as a wrong password
        std::hint::black_box(verify_password(password, &dummy_hash(rounds)));
        return Err(AuthError::InvalidCredentials);
    };

    let stored: String = row.get("password_hash");
    if !verify_password(password, &stored) {
        return Err(AuthError::InvalidCredentials);
    }

    let user_id: i64 = row.get("id");
    let (access_token, expires_in) = signer
        .issue(user_id, &email)
        .map_err(|_| AuthError::InvalidToken)?;

    Ok(LoginResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in,
    })
}
