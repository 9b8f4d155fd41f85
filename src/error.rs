use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid credentials")]
    WrongCredentials,
    #[error("Missing credentials")]
    MissingCredentials,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Invalid Google Token")]
    InvalidGoogleToken,
    #[error("Token creation error")]
    TokenCreation,
    #[error("Access Restricted. Please login with your {0} email.")]
    DomainRestricted(String),
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Db connection error")]
    DbConnection,
    #[error("Server error")]
    Database(#[from] diesel::result::Error),

    #[error("User not found")]
    UserNotFound,
    #[error("Event not found")]
    EventNotFound,
    #[error("{0}")]
    BadRequest(String),

    #[error("Event is not open for registration")]
    EventNotOpen,
    #[error("No slots defined. Admin must add a slot first.")]
    NoSlots,
    #[error("All slots for this event are full")]
    SlotsFull,
    #[error("Slot already exists for this floor and counter")]
    DuplicateSlot,
    #[error("Registration already exists")]
    DuplicateRegistration,
    #[error("Coupon already redeemed. You have been served.")]
    AlreadyRedeemed,

    #[error("Invalid QR Token")]
    InvalidQrToken,
    #[error("Student already served")]
    AlreadyServed,
    #[error("Coupon expired")]
    CouponExpired,
    #[error("Event is not active")]
    EventNotActive,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::WrongCredentials
            | ApiError::MissingCredentials
            | ApiError::InvalidToken
            | ApiError::InvalidGoogleToken => StatusCode::UNAUTHORIZED,
            ApiError::TokenCreation | ApiError::DbConnection | ApiError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::DomainRestricted(_) | ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::UserNotFound
            | ApiError::EventNotFound
            | ApiError::NoSlots
            | ApiError::InvalidQrToken => StatusCode::NOT_FOUND,
            ApiError::SlotsFull | ApiError::DuplicateSlot | ApiError::DuplicateRegistration => {
                StatusCode::CONFLICT
            }
            ApiError::BadRequest(_)
            | ApiError::EventNotOpen
            | ApiError::AlreadyRedeemed
            | ApiError::AlreadyServed
            | ApiError::CouponExpired
            | ApiError::EventNotActive => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Database(e) = &self {
            tracing::error!("database error: {}", e);
        }
        let status = self.status();
        let body = match self {
            ApiError::AlreadyRedeemed => json!({
                "error": self.to_string(),
                "isRedeemed": true,
            }),
            _ => json!({
                "error": self.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
