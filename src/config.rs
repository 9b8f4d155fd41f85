use std::{env, fmt::Display, str::FromStr};

use chrono::TimeDelta;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key} value: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub google_client_id: String,
    pub acl_model: String,
    pub acl_policy: String,
    pub port: u16,
    pub email_domain: String,
    pub admin_username: String,
    /// Argon2 PHC string. Password login is disabled when absent.
    pub admin_password_hash: Option<String>,
    /// Lifetime of tokens issued on Google sign-in
    pub student_session: TimeDelta,
    /// Lifetime of tokens issued on admin password login
    pub admin_session: TimeDelta,
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            google_client_id: required("GOOGLE_CLIENT_ID")?,
            acl_model: with_default("ACL_MODEL", "acl/model.conf")?,
            acl_policy: with_default("ACL_POLICY", "acl/policy.csv")?,
            port: with_default("PORT", "3000")?,
            email_domain: with_default("ALLOWED_EMAIL_DOMAIN", "iiitkottayam.ac.in")?,
            admin_username: with_default("ADMIN_USERNAME", "admin")?,
            admin_password_hash: optional("ADMIN_PASSWORD_HASH"),
            student_session: session_length(
                "STUDENT_SESSION_DAYS",
                with_default("STUDENT_SESSION_DAYS", "30")?,
                MAX_STUDENT_SESSION_DAYS,
                TimeDelta::try_days,
            )?,
            admin_session: session_length(
                "ADMIN_SESSION_HOURS",
                with_default("ADMIN_SESSION_HOURS", "12")?,
                MAX_ADMIN_SESSION_HOURS,
                TimeDelta::try_hours,
            )?,
            cors_origin: optional("CORS_ORIGIN"),
        })
    }
}

const MAX_STUDENT_SESSION_DAYS: i64 = 3650;
const MAX_ADMIN_SESSION_HOURS: i64 = 8760;

fn session_length(
    key: &'static str,
    value: i64,
    max: i64,
    unit: fn(i64) -> Option<TimeDelta>,
) -> Result<TimeDelta, ConfigError> {
    if !(1..=max).contains(&value) {
        return Err(ConfigError::Invalid {
            key,
            message: format!("{value} is outside 1..={max}"),
        });
    }
    unit(value).ok_or_else(|| ConfigError::Invalid {
        key,
        message: format!("{value} is out of range"),
    })
}

fn optional(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn with_default<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    optional(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        })
}
