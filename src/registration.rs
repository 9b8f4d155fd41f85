use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{NaiveDate, NaiveDateTime};
use diesel::dsl::{insert_into, now};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{
    ExpressionMethods, JoinOnDsl, NullableExpressionMethods, OptionalExtension, QueryDsl,
    SelectableHelper,
};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{authorize, authorize_current, Claims};
use crate::error::ApiError;
use crate::event::{find_event, slot_occupancy};
use crate::model::{
    Event, EventSlot, EventStatus, NewRegistrationRow, NewVolunteerActionRow, Registration,
    RegistrationStatus, Role, VolunteerAction,
};
use crate::schema::{event_slots, events, registrations, users, volunteer_actions};
use crate::REGISTRATION_TAG;

/// expose the registration OpenAPI to parent module
pub fn registration_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(register))
        .routes(routes!(scan))
        .routes(routes!(my_registrations))
}

/// One-time coupon token: 16 random bytes, lowercase hex.
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Slots that still have room for another registrant.
pub fn open_slots<'a>(
    slots: &'a [EventSlot],
    occupancy: &HashMap<i32, i64>,
) -> Vec<&'a EventSlot> {
    slots
        .iter()
        .filter(|slot| {
            occupancy.get(&slot.slot_id).copied().unwrap_or(0) < i64::from(slot.capacity)
        })
        .collect()
}

/// Uniform random choice among the open slots.
pub fn pick_slot(slots: &[EventSlot], occupancy: &HashMap<i32, i64>) -> Option<i32> {
    open_slots(slots, occupancy)
        .choose(&mut rand::rng())
        .map(|slot| slot.slot_id)
}

/// Only `registered` coupons can be redeemed.
pub fn ensure_redeemable(status: RegistrationStatus) -> Result<(), ApiError> {
    match status {
        RegistrationStatus::Registered => Ok(()),
        RegistrationStatus::Served => Err(ApiError::AlreadyServed),
        RegistrationStatus::Expired => Err(ApiError::CouponExpired),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub event_id: i32,
    /// Student to register; only honoured for admins
    pub student_id: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegistrationBody {
    pub message: String,
    pub data: Coupon,
}

/// A registration as returned to its holder.
#[derive(Debug, Serialize, ToSchema)]
pub struct Coupon {
    pub registration_id: i32,
    pub student_id: i32,
    pub event_id: i32,
    pub slot_id: i32,
    /// Present only while the coupon can still be redeemed
    pub qr_token: Option<String>,
    pub status: RegistrationStatus,
    pub created_at: NaiveDateTime,
    pub served_at: Option<NaiveDateTime>,
}

impl From<Registration> for Coupon {
    fn from(registration: Registration) -> Self {
        let redeemable = registration.status == RegistrationStatus::Registered;
        Coupon {
            registration_id: registration.registration_id,
            student_id: registration.student_id,
            event_id: registration.event_id,
            slot_id: registration.slot_id,
            qr_token: redeemable.then_some(registration.qr_token),
            status: registration.status,
            created_at: registration.created_at,
            served_at: registration.served_at,
        }
    }
}

enum Enrollment {
    Existing(Registration),
    Created(Registration),
}

async fn enroll(
    conn: &mut AsyncPgConnection,
    student: i32,
    event: i32,
) -> Result<Enrollment, ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        async move {
            let existing = registrations::table
                .filter(registrations::student_id.eq(student))
                .filter(registrations::event_id.eq(event))
                .select(Registration::as_select())
                .first::<Registration>(conn)
                .await
                .optional()?;
            if let Some(existing) = existing {
                return match existing.status {
                    RegistrationStatus::Served => Err(ApiError::AlreadyRedeemed),
                    _ => Ok(Enrollment::Existing(existing)),
                };
            }

            // a concurrent close waits for this registration, then expires it
            let target = events::table
                .find(event)
                .select(Event::as_select())
                .for_share()
                .first::<Event>(conn)
                .await
                .optional()?
                .ok_or(ApiError::EventNotFound)?;
            if target.status != EventStatus::Active {
                return Err(ApiError::EventNotOpen);
            }

            // row locks on the slots serialize concurrent registrations for this event
            let slots = event_slots::table
                .filter(event_slots::event_id.eq(event))
                .select(EventSlot::as_select())
                .for_update()
                .load::<EventSlot>(conn)
                .await?;
            if slots.is_empty() {
                return Err(ApiError::NoSlots);
            }
            let occupancy = slot_occupancy(conn, event).await?;
            let slot = pick_slot(&slots, &occupancy).ok_or(ApiError::SlotsFull)?;

            let row = NewRegistrationRow {
                student_id: student,
                event_id: event,
                slot_id: slot,
                qr_token: generate_token(),
                status: RegistrationStatus::Registered,
            };
            let created = insert_into(registrations::table)
                .values(&row)
                .returning(Registration::as_returning())
                .get_result::<Registration>(conn)
                .await
                .map_err(|e| match e {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        ApiError::DuplicateRegistration
                    }
                    DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                        ApiError::UserNotFound
                    }
                    e => ApiError::Database(e),
                })?;
            Ok(Enrollment::Created(created))
        }
        .scope_boxed()
    })
    .await
}

/// Register for an event
///
/// Returns the existing coupon when the student already holds an unredeemed one,
/// otherwise assigns a random slot with free capacity and issues a new coupon.
#[utoipa::path(
    post,
    path = "/registrations",
    request_body = RegisterRequest,
    responses(
        (status = CREATED, body = RegistrationBody),
        (status = OK, body = RegistrationBody, description = "Existing registration"),
        (status = BAD_REQUEST, description = "Coupon already redeemed or event closed"),
        (status = NOT_FOUND, description = "Unknown event or no slots"),
        (status = CONFLICT, description = "All slots full")
    ),
    tag = REGISTRATION_TAG,
    security(
        ("session_jwt" = [])
    )
)]
async fn register(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegistrationBody>), ApiError> {
    authorize(&enforcer, &claims, "registration", "create")?;
    let student = match claims.role {
        Role::Student => claims.sub,
        _ => request
            .student_id
            .ok_or_else(|| ApiError::BadRequest("student_id is required".to_string()))?,
    };

    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    match enroll(&mut conn, student, request.event_id).await? {
        Enrollment::Existing(data) => Ok((
            StatusCode::OK,
            Json(RegistrationBody {
                message: "Existing registration retrieved".to_string(),
                data: data.into(),
            }),
        )),
        Enrollment::Created(data) => {
            tracing::info!(
                "student {} registered for event {} in slot {}",
                data.student_id,
                data.event_id,
                data.slot_id
            );
            Ok((
                StatusCode::CREATED,
                Json(RegistrationBody {
                    message: "Registration successful".to_string(),
                    data: data.into(),
                }),
            ))
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScanRequest {
    pub qr_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScanBody {
    pub message: String,
    pub registration_id: i32,
    pub student_id: i32,
    pub student_name: String,
    pub batch: Option<String>,
}

async fn redeem(
    conn: &mut AsyncPgConnection,
    token: String,
    volunteer: i32,
) -> Result<ScanBody, ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        async move {
            let registration = registrations::table
                .filter(registrations::qr_token.eq(&token))
                .select(Registration::as_select())
                .for_update()
                .first::<Registration>(conn)
                .await
                .optional()?
                .ok_or(ApiError::InvalidQrToken)?;
            ensure_redeemable(registration.status)?;

            let event = find_event(conn, registration.event_id).await?;
            if event.status != EventStatus::Active {
                return Err(ApiError::EventNotActive);
            }

            diesel::update(registrations::table.find(registration.registration_id))
                .set((
                    registrations::status.eq(RegistrationStatus::Served),
                    registrations::served_at.eq(now.nullable()),
                ))
                .execute(conn)
                .await?;
            insert_into(volunteer_actions::table)
                .values(&NewVolunteerActionRow {
                    volunteer_id: volunteer,
                    registration_id: registration.registration_id,
                    action: VolunteerAction::Scan,
                })
                .execute(conn)
                .await?;

            let (student_name, batch) = users::table
                .find(registration.student_id)
                .select((users::name, users::batch))
                .first::<(String, Option<String>)>(conn)
                .await?;
            Ok(ScanBody {
                message: "Scan successful".to_string(),
                registration_id: registration.registration_id,
                student_id: registration.student_id,
                student_name,
                batch,
            })
        }
        .scope_boxed()
    })
    .await
}

/// Redeem a coupon
#[utoipa::path(
    post,
    path = "/registrations/scan",
    request_body = ScanRequest,
    responses(
        (status = OK, body = ScanBody),
        (status = BAD_REQUEST, description = "Already served, expired, or event inactive"),
        (status = NOT_FOUND, description = "Invalid QR token")
    ),
    tag = REGISTRATION_TAG,
    security(
        ("session_jwt" = [])
    )
)]
async fn scan(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(ScanRequest { qr_token }): Json<ScanRequest>,
) -> Result<Json<ScanBody>, ApiError> {
    authorize(&enforcer, &claims, "registration", "scan")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "registration", "scan").await?;
    let served = redeem(&mut conn, qr_token.trim().to_string(), claims.sub)
        .await
        .inspect_err(|e| tracing::debug!("scan by {} rejected: {}", claims.sub, e))?;
    tracing::info!(
        "volunteer {} served registration {}",
        claims.sub,
        served.registration_id
    );
    Ok(Json(served))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MyRegistration {
    pub registration_id: i32,
    pub event_id: i32,
    pub event_name: String,
    pub event_date: NaiveDate,
    pub status: RegistrationStatus,
    /// Present only while the coupon can still be redeemed
    pub qr_token: Option<String>,
    pub floor: String,
    pub counter: i32,
    pub time_start: NaiveDateTime,
    pub time_end: NaiveDateTime,
    pub served_at: Option<NaiveDateTime>,
}

impl MyRegistration {
    fn new(
        registration: Registration,
        event_name: String,
        event_date: NaiveDate,
        slot: EventSlot,
    ) -> Self {
        let redeemable = registration.status == RegistrationStatus::Registered;
        MyRegistration {
            registration_id: registration.registration_id,
            event_id: registration.event_id,
            event_name,
            event_date,
            status: registration.status,
            qr_token: redeemable.then_some(registration.qr_token),
            floor: slot.floor,
            counter: slot.counter,
            time_start: slot.time_start,
            time_end: slot.time_end,
            served_at: registration.served_at,
        }
    }
}

/// Registrations of the current user
#[utoipa::path(get, path = "/registrations/me", responses((status = OK, body = Vec<MyRegistration>)), tag = REGISTRATION_TAG, security(
    ("session_jwt" = [])
))]
async fn my_registrations(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
) -> Result<Json<Vec<MyRegistration>>, ApiError> {
    authorize(&enforcer, &claims, "registration", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let rows = registrations::table
        .inner_join(events::table)
        .inner_join(event_slots::table.on(event_slots::slot_id.eq(registrations::slot_id)))
        .filter(registrations::student_id.eq(claims.sub))
        .order(registrations::created_at.desc())
        .select((
            Registration::as_select(),
            events::name,
            events::date,
            EventSlot::as_select(),
        ))
        .load::<(Registration, String, NaiveDate, EventSlot)>(&mut conn)
        .await?;
    Ok(Json(
        rows.into_iter()
            .map(|(registration, name, date, slot)| {
                MyRegistration::new(registration, name, date, slot)
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: i32, capacity: i32) -> EventSlot {
        EventSlot {
            slot_id: id,
            event_id: 1,
            floor: "Ground".into(),
            counter: id,
            capacity,
            time_start: NaiveDateTime::default(),
            time_end: NaiveDateTime::default(),
            created_at: NaiveDateTime::default(),
        }
    }

    #[test]
    fn tokens_are_32_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn full_slots_are_skipped() {
        let slots = vec![slot(1, 2), slot(2, 2), slot(3, 5)];
        let occupancy = HashMap::from([(1, 2), (3, 4)]);
        let open: Vec<i32> = open_slots(&slots, &occupancy)
            .iter()
            .map(|s| s.slot_id)
            .collect();
        assert_eq!(open, vec![2, 3]);
    }

    #[test]
    fn pick_only_returns_open_slots() {
        let slots = vec![slot(1, 1), slot(2, 3)];
        let occupancy = HashMap::from([(1, 1)]);
        for _ in 0..50 {
            assert_eq!(pick_slot(&slots, &occupancy), Some(2));
        }
    }

    #[test]
    fn pick_spreads_across_open_slots() {
        let slots = vec![slot(1, 100), slot(2, 100)];
        let picks: Vec<i32> = (0..200)
            .filter_map(|_| pick_slot(&slots, &HashMap::new()))
            .collect();
        assert!(picks.contains(&1));
        assert!(picks.contains(&2));
    }

    #[test]
    fn no_pick_when_everything_is_full() {
        let slots = vec![slot(1, 1)];
        assert_eq!(pick_slot(&slots, &HashMap::from([(1, 1)])), None);
        assert_eq!(pick_slot(&[], &HashMap::new()), None);
    }

    #[test]
    fn only_registered_coupons_are_redeemable() {
        assert!(ensure_redeemable(RegistrationStatus::Registered).is_ok());
        assert!(matches!(
            ensure_redeemable(RegistrationStatus::Served),
            Err(ApiError::AlreadyServed)
        ));
        assert!(matches!(
            ensure_redeemable(RegistrationStatus::Expired),
            Err(ApiError::CouponExpired)
        ));
    }

    #[test]
    fn served_registrations_hide_their_token() {
        let registration = Registration {
            registration_id: 4,
            student_id: 9,
            event_id: 1,
            slot_id: 1,
            qr_token: "abc".into(),
            status: RegistrationStatus::Served,
            created_at: NaiveDateTime::default(),
            served_at: Some(NaiveDateTime::default()),
        };
        let mine = MyRegistration::new(
            registration,
            "Onam Lunch".into(),
            NaiveDate::from_ymd_opt(2024, 9, 15).unwrap(),
            slot(1, 10),
        );
        assert!(mine.qr_token.is_none());
        assert_eq!(mine.event_name, "Onam Lunch");
    }

    fn registration(status: RegistrationStatus) -> Registration {
        Registration {
            registration_id: 4,
            student_id: 9,
            event_id: 1,
            slot_id: 1,
            qr_token: "0f1e2d3c".into(),
            status,
            created_at: NaiveDateTime::default(),
            served_at: None,
        }
    }

    #[test]
    fn returned_coupons_carry_the_token_while_redeemable() {
        let coupon = Coupon::from(registration(RegistrationStatus::Registered));
        assert_eq!(coupon.qr_token.as_deref(), Some("0f1e2d3c"));
    }

    #[test]
    fn expired_coupons_are_returned_without_their_token() {
        let coupon = Coupon::from(registration(RegistrationStatus::Expired));
        assert!(coupon.qr_token.is_none());
        assert_eq!(coupon.status, RegistrationStatus::Expired);
        let body = serde_json::to_value(&coupon).unwrap();
        assert!(body["qr_token"].is_null());
    }
}
