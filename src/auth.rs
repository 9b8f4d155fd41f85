use axum::{async_trait, extract::FromRequestParts, http::request::Parts, RequestPartsExt};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use casbin::{CoreApi, Enforcer};
use chrono::{Duration, Utc};
use diesel::{OptionalExtension, QueryDsl};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::Modify;

use crate::error::ApiError;
use crate::model::{Role, User};
use crate::schema::users;

pub struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user: &User, lifetime: Duration) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user.user_id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
            batch: user.batch.clone(),
            exp: Utc::now()
                .checked_add_signed(lifetime)
                .ok_or(ApiError::TokenCreation)?
                .timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|e| {
            tracing::error!("issue: {}", e);
            ApiError::TokenCreation
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("verify: {}", e);
                ApiError::InvalidToken
            })
    }
}

/// Session token payload. `sub` is the `users.user_id` of the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i32,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub batch: Option<String>,
    pub exp: i64,
}

#[async_trait]
impl FromRequestParts<crate::State> for Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::State,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::MissingCredentials)?;
        state.keys.verify(bearer.token())
    }
}

/// Checks the ACL policy for `(role, object, action)`.
pub fn authorize(
    enforcer: &Enforcer,
    claims: &Claims,
    object: &str,
    action: &str,
) -> Result<(), ApiError> {
    enforce_role(enforcer, claims.role, object, action)
}

/// Like [`authorize`], but against the role currently stored for the caller.
/// Privileged writes use it so a demotion applies before the session expires.
pub async fn authorize_current(
    enforcer: &Enforcer,
    conn: &mut AsyncPgConnection,
    claims: &Claims,
    object: &str,
    action: &str,
) -> Result<(), ApiError> {
    let current = users::table
        .find(claims.sub)
        .select(users::role)
        .first::<Role>(conn)
        .await
        .optional()?
        .ok_or(ApiError::InvalidToken)?;
    if current != claims.role {
        tracing::info!(
            "user {} acts as {} but is now {}",
            claims.sub,
            claims.role,
            current
        );
    }
    enforce_role(enforcer, current, object, action)
}

fn enforce_role(
    enforcer: &Enforcer,
    role: Role,
    object: &str,
    action: &str,
) -> Result<(), ApiError> {
    if enforcer
        .enforce((role.as_str(), object, action))
        .unwrap_or_default()
    {
        Ok(())
    } else {
        tracing::debug!("authorize: {} denied {} on {}", role, action, object);
        Err(ApiError::PermissionDenied)
    }
}

/// Identity asserted by a verified Google ID token.
#[derive(Debug, Clone)]
pub struct GoogleIdentity {
    pub google_id: String,
    pub email: String,
    pub name: String,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, ApiError>;
}

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

/// Verifies ID tokens against Google's `tokeninfo` endpoint.
pub struct GoogleVerifier {
    client: reqwest::Client,
    client_id: String,
}

impl GoogleVerifier {
    pub fn new(client_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    aud: String,
    sub: String,
    email: Option<String>,
    email_verified: Option<String>,
    name: Option<String>,
}

impl TokenInfo {
    fn into_identity(self, client_id: &str) -> Result<GoogleIdentity, ApiError> {
        if self.aud != client_id {
            tracing::debug!("google token audience mismatch: {}", self.aud);
            return Err(ApiError::InvalidGoogleToken);
        }
        if self.email_verified.as_deref() != Some("true") {
            return Err(ApiError::InvalidGoogleToken);
        }
        let email = self.email.ok_or(ApiError::InvalidGoogleToken)?;
        let name = self
            .name
            .unwrap_or_else(|| email.split('@').next().unwrap_or_default().to_string());
        Ok(GoogleIdentity {
            google_id: self.sub,
            email,
            name,
        })
    }
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, ApiError> {
        let response = self
            .client
            .get(TOKENINFO_URL)
            .query(&[("id_token", id_token)])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("google tokeninfo unreachable: {}", e);
                ApiError::InvalidGoogleToken
            })?;
        if !response.status().is_success() {
            tracing::debug!("google tokeninfo rejected token: {}", response.status());
            return Err(ApiError::InvalidGoogleToken);
        }
        let info: TokenInfo = response.json().await.map_err(|e| {
            tracing::debug!("google tokeninfo parse failed: {}", e);
            ApiError::InvalidGoogleToken
        })?;
        info.into_identity(&self.client_id)
    }
}

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "session_jwt",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn student() -> User {
        User {
            user_id: 7,
            name: "Sanjay S".into(),
            google_id: Some("g-7".into()),
            email: "sanjays24bec18@iiitkottayam.ac.in".into(),
            role: Role::Student,
            batch: Some("2024".into()),
            created_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn issued_tokens_verify_with_the_same_secret() {
        let keys = Keys::new("secret");
        let token = keys.issue(&student(), Duration::days(30)).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, 7);
        assert_eq!(claims.role, Role::Student);
        assert_eq!(claims.batch.as_deref(), Some("2024"));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let token = Keys::new("one").issue(&student(), Duration::days(1)).unwrap();
        assert!(matches!(
            Keys::new("two").verify(&token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keys = Keys::new("secret");
        let token = keys.issue(&student(), Duration::hours(-2)).unwrap();
        assert!(matches!(keys.verify(&token), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn lifetimes_past_the_calendar_fail_instead_of_panicking() {
        let lifetime = Duration::try_days(1_000_000_000).unwrap();
        assert!(matches!(
            Keys::new("secret").issue(&student(), lifetime),
            Err(ApiError::TokenCreation)
        ));
    }

    fn token_info(aud: &str, verified: Option<&str>) -> TokenInfo {
        TokenInfo {
            aud: aud.into(),
            sub: "1234".into(),
            email: Some("anu23bcs5@iiitkottayam.ac.in".into()),
            email_verified: verified.map(str::to_string),
            name: None,
        }
    }

    #[test]
    fn token_info_requires_matching_audience() {
        assert!(token_info("other-client", Some("true"))
            .into_identity("client")
            .is_err());
    }

    #[test]
    fn token_info_requires_verified_email() {
        assert!(token_info("client", Some("false"))
            .into_identity("client")
            .is_err());
        assert!(token_info("client", None).into_identity("client").is_err());
    }

    #[test]
    fn token_info_falls_back_to_local_part_for_name() {
        let identity = token_info("client", Some("true"))
            .into_identity("client")
            .unwrap();
        assert_eq!(identity.google_id, "1234");
        assert_eq!(identity.name, "anu23bcs5");
    }
}
