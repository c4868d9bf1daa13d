//! Accounts and bearer tokens.
//!
//! Passwords are stored as salted SHA-256 hashes. Bearer tokens are
//! `base64(user_id:expiry).hex_hmac_signature`, signed with HMAC-SHA256
//! over the `[auth] token_secret`. Validation failures all surface the
//! same message so a caller cannot distinguish a forged signature from an
//! expired token.

use anyhow::{bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::User;

type HmacSha256 = Hmac<Sha256>;

const INVALID_CREDENTIALS: &str = "Could not validate credentials";

/// Hex SHA-256 of `salt:password`.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hmac_sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mints a signed bearer token for a user, valid for `ttl_hours`.
pub fn create_token(secret: &str, user_id: i64, ttl_hours: i64) -> String {
    let expiry = chrono::Utc::now().timestamp() + ttl_hours * 3600;
    let payload = URL_SAFE_NO_PAD.encode(format!("{}:{}", user_id, expiry));
    let signature = hmac_sign(secret, &payload);
    format!("{}.{}", payload, signature)
}

/// Verifies a bearer token's signature and expiry; returns the user id.
pub fn verify_token(secret: &str, token: &str) -> Result<i64> {
    let (payload, signature) = token
        .split_once('.')
        .ok_or_else(|| anyhow::anyhow!(INVALID_CREDENTIALS))?;

    let sig_bytes = hex::decode(signature).map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig_bytes)
        .map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;
    let decoded = String::from_utf8(decoded).map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;
    let (user_id, expiry) = decoded
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!(INVALID_CREDENTIALS))?;
    let user_id: i64 = user_id.parse().map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;
    let expiry: i64 = expiry.parse().map_err(|_| anyhow::anyhow!(INVALID_CREDENTIALS))?;

    if expiry < chrono::Utc::now().timestamp() {
        bail!(INVALID_CREDENTIALS);
    }
    Ok(user_id)
}

/// Registers a new account and returns a bearer token.
pub async fn signup(
    pool: &SqlitePool,
    secret: &str,
    ttl_hours: i64,
    email: &str,
    password: &str,
) -> Result<String> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        bail!("Email already registered");
    }

    let salt = Uuid::new_v4().to_string();
    let hashed = hash_password(password, &salt);
    let now = chrono::Utc::now().to_rfc3339();

    let user_id = sqlx::query(
        "INSERT INTO users (email, hashed_password, salt, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(email)
    .bind(&hashed)
    .bind(&salt)
    .bind(&now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(create_token(secret, user_id, ttl_hours))
}

/// Checks credentials and returns a bearer token.
pub async fn login(
    pool: &SqlitePool,
    secret: &str,
    ttl_hours: i64,
    email: &str,
    password: &str,
) -> Result<String> {
    let row = sqlx::query("SELECT id, hashed_password, salt FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        bail!("Incorrect username or password");
    };
    let user_id: i64 = row.get("id");
    let hashed: String = row.get("hashed_password");
    let salt: String = row.get("salt");

    if hash_password(password, &salt) != hashed {
        bail!("Incorrect username or password");
    }

    Ok(create_token(secret, user_id, ttl_hours))
}

/// Resolves a bearer token to its user.
pub async fn current_user(pool: &SqlitePool, secret: &str, token: &str) -> Result<User> {
    let user_id = verify_token(secret, token)?;

    let row = sqlx::query("SELECT id, email FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        bail!(INVALID_CREDENTIALS);
    };
    Ok(User {
        id: row.get("id"),
        email: row.get("email"),
    })
}
