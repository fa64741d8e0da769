use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::info;
use uuid::Uuid;

use axis_db::Database;
use axis_gateway::dispatcher::Dispatcher;
use axis_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, Success};

use crate::blocking;
use crate::error::{ApiError, ApiJson, FieldErrors};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
    /// Shared secret for billing webhook signatures; the route refuses events when unset.
    pub webhook_secret: Option<String>,
}

/// Argon2id PHC string with a fresh OS-random salt.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string())
}

/// Usernames double as @mention handles, so they share its character set.
pub fn is_valid_username(name: &str) -> bool {
    (3..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

pub async fn register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut errors = FieldErrors::default();
    errors.check(
        is_valid_username(&req.username),
        "username",
        "3-32 characters: letters, digits, '_', '-' or '.'",
    );
    errors.check(req.password.len() >= 8, "password", "at least 8 characters");
    errors.into_result()?;

    // Check if username is taken
    let username = req.username.clone();
    if blocking(&state, move |db| db.get_user_by_username(&username)).await?.is_some() {
        return Err(ApiError::Conflict("username already taken".into()));
    }

    let password_hash = hash_password(&req.password)?;

    let user_id = Uuid::new_v4();
    let username = req.username.clone();
    blocking(&state, move |db| {
        db.create_user(&user_id.to_string(), &username, &password_hash)
    })
    .await?;

    info!("Registered user {} ({})", req.username, user_id);
    let token = create_token(&state.jwt_secret, user_id, &req.username)?;

    Ok((
        StatusCode::CREATED,
        Json(Success::new(RegisterResponse { user_id, token })),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.clone();
    let user = blocking(&state, move |db| db.get_user_by_username(&username))
        .await?
        .ok_or(ApiError::Unauthorized)?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| anyhow::anyhow!("stored hash for {} is corrupt: {}", user.id, e))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized)?;

    let user_id: Uuid = user.id.parse().map_err(anyhow::Error::from)?;
    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(Success::new(LoginResponse {
        user_id,
        username: user.username,
        token,
    })))
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(is_valid_username("ana.maria_99"));
        assert!(!is_valid_username("al"));
        assert!(!is_valid_username("has space"));
        assert!(!is_valid_username("émile"));
    }

    #[test]
    fn each_hash_gets_its_own_salt() {
        let first = hash_password("correct horse").unwrap();
        let second = hash_password("correct horse").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2id$"));
        let parsed = PasswordHash::new(&first).unwrap();
        assert!(Argon2::default().verify_password(b"correct horse", &parsed).is_ok());
    }
}
