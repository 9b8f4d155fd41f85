use std::sync::LazyLock;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::extract::State;
use axum::Json;
use diesel::dsl::insert_into;
use diesel::upsert::excluded;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::Config;
use crate::error::ApiError;
use crate::model::{NewUserRow, Role, User};
use crate::schema::users::dsl::*;
use crate::AUTH_TAG;

/// `<name><2-digit year><course><roll>`, e.g. `sanjays24bec18`.
static BATCH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-z]+(\d{2})[a-z]+\d+$").expect("batch pattern is valid")
});

/// Intake year encoded in an institutional email, `sanjays24bec18@...` -> `2024`.
pub fn extract_batch(address: &str) -> Option<String> {
    let local_part = address.split('@').next()?;
    BATCH_PATTERN
        .captures(local_part)
        .and_then(|caps| caps.get(1))
        .map(|year| format!("20{}", year.as_str()))
}

pub fn is_allowed_email(address: &str, domain: &str) -> bool {
    address
        .to_ascii_lowercase()
        .ends_with(&format!("@{}", domain.to_ascii_lowercase()))
}

fn admin_password_matches(config: &Config, username: &str, password: &str) -> bool {
    if username != config.admin_username {
        return false;
    }
    let Some(stored) = config.admin_password_hash.as_deref() else {
        tracing::debug!("admin login attempted but no password hash is configured");
        return false;
    };
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::error!("ADMIN_PASSWORD_HASH is not a valid PHC string: {}", e);
            false
        }
    }
}

/// expose the sign-in OpenAPI to parent module
pub fn auth_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(google_login))
        .routes(routes!(admin_login))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GoogleLogin {
    /// Google ID token obtained by the frontend
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdminLogin {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionUser {
    pub user_id: i32,
    pub name: String,
    pub role: Role,
    pub batch: Option<String>,
}

impl From<&User> for SessionUser {
    fn from(user: &User) -> Self {
        SessionUser {
            user_id: user.user_id,
            name: user.name.clone(),
            role: user.role,
            batch: user.batch.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthBody {
    pub message: String,
    pub token: String,
    pub user: SessionUser,
}

/// Sign in with a Google ID token
///
/// First sign-in of an institutional address creates a student account.
#[utoipa::path(
    post,
    path = "/auth/google",
    request_body = GoogleLogin,
    responses(
        (status = OK, body = AuthBody),
        (status = UNAUTHORIZED, description = "Invalid Google token"),
        (status = FORBIDDEN, description = "Email outside the allowed domain")
    ),
    tag = AUTH_TAG
)]
async fn google_login(
    State(crate::State {
        pool,
        keys,
        config,
        verifier,
        ..
    }): State<crate::State>,
    Json(GoogleLogin { token }): Json<GoogleLogin>,
) -> Result<Json<AuthBody>, ApiError> {
    let identity = verifier.verify(&token).await?;
    if !is_allowed_email(&identity.email, &config.email_domain) {
        return Err(ApiError::DomainRestricted(config.email_domain.clone()));
    }

    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let existing = users
        .filter(email.eq(&identity.email))
        .select(User::as_select())
        .first::<User>(&mut conn)
        .await
        .optional()?;

    let user = match existing {
        Some(user) => user,
        None => {
            tracing::info!("Creating new user for {}", identity.email);
            let new_user = NewUserRow {
                name: identity.name,
                google_id: Some(identity.google_id),
                batch: extract_batch(&identity.email),
                email: identity.email,
                role: Role::Student,
            };
            insert_into(users)
                .values(&new_user)
                .returning(User::as_returning())
                .get_result::<User>(&mut conn)
                .await?
        }
    };

    let token = keys.issue(&user, config.student_session)?;
    Ok(Json(AuthBody {
        message: "Login successful".to_string(),
        token,
        user: SessionUser::from(&user),
    }))
}

/// Admin password sign-in
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = AdminLogin,
    responses(
        (status = OK, body = AuthBody),
        (status = UNAUTHORIZED, description = "Invalid credentials")
    ),
    tag = AUTH_TAG
)]
async fn admin_login(
    State(crate::State {
        pool, keys, config, ..
    }): State<crate::State>,
    Json(login): Json<AdminLogin>,
) -> Result<Json<AuthBody>, ApiError> {
    if !admin_password_matches(&config, &login.username, &login.password) {
        return Err(ApiError::WrongCredentials);
    }

    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let admin = NewUserRow {
        name: "Super Admin".to_string(),
        google_id: None,
        email: format!("{}@{}", config.admin_username, config.email_domain),
        role: Role::Admin,
        batch: None,
    };
    let user = insert_into(users)
        .values(&admin)
        .on_conflict(email)
        .do_update()
        .set(role.eq(excluded(role)))
        .returning(User::as_returning())
        .get_result::<User>(&mut conn)
        .await
        .map_err(|e| {
            tracing::debug!("admin_login: {}", e);
            ApiError::Database(e)
        })?;

    let token = keys.issue(&user, config.admin_session)?;
    Ok(Json(AuthBody {
        message: "Admin login successful".to_string(),
        token,
        user: SessionUser::from(&user),
    }))
}
