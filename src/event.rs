use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use diesel::dsl::{count_star, insert_into, now};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, QueryResult, SelectableHelper};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{authorize, authorize_current, Claims};
use crate::error::ApiError;
use crate::model::{
    Event, EventChanges, EventPatch, EventSlot, EventStatus, NewEvent, NewEventRow, NewSlot,
    NewSlotRow, Registration, RegistrationStatus, Role, VolunteerAction,
};
use crate::schema::{event_slots, events, registrations, users, volunteer_actions};
use crate::validate::ValidatedForm;
use crate::EVENT_TAG;

/// expose the event OpenAPI to parent module
pub fn event_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(list_events, create_event))
        .routes(routes!(update_event, close_event))
        .routes(routes!(active_events))
}

/// expose the slot OpenAPI to parent module
pub fn slot_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new().routes(routes!(list_slots, create_slot))
}

/// expose the statistics OpenAPI to parent module
pub fn stats_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(event_stats))
        .routes(routes!(volunteer_stats))
}

pub(crate) async fn find_event(
    conn: &mut AsyncPgConnection,
    id: i32,
) -> Result<Event, ApiError> {
    events::table
        .find(id)
        .select(Event::as_select())
        .first::<Event>(conn)
        .await
        .optional()?
        .ok_or(ApiError::EventNotFound)
}

/// Number of registrations assigned to each slot of an event.
pub(crate) async fn slot_occupancy(
    conn: &mut AsyncPgConnection,
    event: i32,
) -> QueryResult<HashMap<i32, i64>> {
    let counts = registrations::table
        .filter(registrations::event_id.eq(event))
        .group_by(registrations::slot_id)
        .select((registrations::slot_id, count_star()))
        .load::<(i32, i64)>(conn)
        .await?;
    Ok(counts.into_iter().collect())
}

async fn expire_registrations(conn: &mut AsyncPgConnection, event: i32) -> QueryResult<usize> {
    diesel::update(
        registrations::table
            .filter(registrations::event_id.eq(event))
            .filter(registrations::status.eq(RegistrationStatus::Registered)),
    )
    .set(registrations::status.eq(RegistrationStatus::Expired))
    .execute(conn)
    .await
}

/// Applies `changes` and expires outstanding coupons once the event is no longer active.
async fn apply_event_changes(
    conn: &mut AsyncPgConnection,
    id: i32,
    changes: EventChanges,
) -> Result<Event, ApiError> {
    conn.transaction::<_, ApiError, _>(|conn| {
        async move {
            let event = if changes.is_empty() {
                find_event(conn, id).await?
            } else {
                diesel::update(events::table.find(id))
                    .set(&changes)
                    .returning(Event::as_returning())
                    .get_result::<Event>(conn)
                    .await
                    .optional()?
                    .ok_or(ApiError::EventNotFound)?
            };
            if event.status != EventStatus::Active {
                let expired = expire_registrations(conn, event.event_id).await?;
                if expired > 0 {
                    tracing::info!(
                        "event {} is {}: expired {} coupons",
                        event.event_id,
                        event.status,
                        expired
                    );
                }
            }
            Ok(event)
        }
        .scope_boxed()
    })
    .await
}

/// List all events
#[utoipa::path(get, path = "/events", responses((status = OK, body = Vec<Event>)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
))]
async fn list_events(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
) -> Result<Json<Vec<Event>>, ApiError> {
    authorize(&enforcer, &claims, "event", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let all = events::table
        .order(events::date.asc())
        .select(Event::as_select())
        .load::<Event>(&mut conn)
        .await?;
    Ok(Json(all))
}

/// Create event
#[utoipa::path(post, path = "/events", request_body = NewEvent, responses((status = CREATED, body = Event)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
))]
async fn create_event(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Json(ValidatedForm(event)): Json<ValidatedForm<NewEvent>>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    authorize(&enforcer, &claims, "event", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "event", "create").await?;
    let row = NewEventRow {
        name: event.name,
        description: event.description,
        date: event.date,
        status: event.status.unwrap_or(EventStatus::Active),
        created_by: Some(claims.sub),
    };
    let created = insert_into(events::table)
        .values(&row)
        .returning(Event::as_returning())
        .get_result::<Event>(&mut conn)
        .await
        .map_err(|e| {
            tracing::debug!("create_event: {}", e);
            ApiError::Database(e)
        })?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Update event
///
/// Absent fields keep their current value.
#[utoipa::path(patch, path = "/events/{id}", request_body = EventPatch, responses((status = OK, body = Event)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
)
)]
async fn update_event(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
    Json(ValidatedForm(patch)): Json<ValidatedForm<EventPatch>>,
) -> Result<Json<Event>, ApiError> {
    authorize(&enforcer, &claims, "event", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "event", "update").await?;
    let event = apply_event_changes(&mut conn, id, patch.into()).await?;
    Ok(Json(event))
}

/// Close event
#[utoipa::path(delete, path = "/events/{id}", responses((status = OK, body = Event)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
)
)]
async fn close_event(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
) -> Result<Json<Event>, ApiError> {
    authorize(&enforcer, &claims, "event", "delete")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "event", "delete").await?;
    let changes = EventChanges {
        status: Some(EventStatus::Closed),
        ..Default::default()
    };
    let event = apply_event_changes(&mut conn, id, changes).await?;
    Ok(Json(event))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ActiveEventsQuery {
    /// Student whose registrations are attached (ignored for students)
    pub student_id: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveEvent {
    #[serde(flatten)]
    pub event: Event,
    pub registration_id: Option<i32>,
    pub registration_status: Option<RegistrationStatus>,
    /// Present only while the coupon can still be redeemed
    pub qr_token: Option<String>,
    pub floor: Option<String>,
    pub counter: Option<i32>,
    pub time_start: Option<NaiveDateTime>,
    pub time_end: Option<NaiveDateTime>,
}

impl From<Event> for ActiveEvent {
    fn from(event: Event) -> Self {
        ActiveEvent {
            event,
            registration_id: None,
            registration_status: None,
            qr_token: None,
            floor: None,
            counter: None,
            time_start: None,
            time_end: None,
        }
    }
}

pub fn attach_registrations(
    active: Vec<Event>,
    registered: Vec<(Registration, EventSlot)>,
) -> Vec<ActiveEvent> {
    let mut by_event: HashMap<i32, (Registration, EventSlot)> = registered
        .into_iter()
        .map(|(registration, slot)| (registration.event_id, (registration, slot)))
        .collect();
    active
        .into_iter()
        .map(|event| {
            let id = event.event_id;
            let mut view = ActiveEvent::from(event);
            if let Some((registration, slot)) = by_event.remove(&id) {
                view.registration_id = Some(registration.registration_id);
                view.registration_status = Some(registration.status);
                if registration.status == RegistrationStatus::Registered {
                    view.qr_token = Some(registration.qr_token);
                }
                view.floor = Some(slot.floor);
                view.counter = Some(slot.counter);
                view.time_start = Some(slot.time_start);
                view.time_end = Some(slot.time_end);
            }
            view
        })
        .collect()
}

/// Upcoming active events with the student's registration and slot
#[utoipa::path(get, path = "/events/active", responses((status = OK, body = Vec<ActiveEvent>)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(ActiveEventsQuery)
)]
async fn active_events(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(query): Query<ActiveEventsQuery>,
) -> Result<Json<Vec<ActiveEvent>>, ApiError> {
    authorize(&enforcer, &claims, "event", "read")?;
    let student = match claims.role {
        Role::Student => Some(claims.sub),
        _ => query.student_id,
    };

    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let upcoming = events::table
        .filter(events::status.eq(EventStatus::Active))
        .filter(events::date.ge(diesel::dsl::date(now)))
        .order(events::date.asc())
        .select(Event::as_select())
        .load::<Event>(&mut conn)
        .await?;

    let registered = match student {
        Some(student) if !upcoming.is_empty() => {
            let ids: Vec<i32> = upcoming.iter().map(|e| e.event_id).collect();
            registrations::table
                .inner_join(event_slots::table)
                .filter(registrations::student_id.eq(student))
                .filter(registrations::event_id.eq_any(ids))
                .select((Registration::as_select(), EventSlot::as_select()))
                .load::<(Registration, EventSlot)>(&mut conn)
                .await?
        }
        _ => Vec::new(),
    };

    Ok(Json(attach_registrations(upcoming, registered)))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SlotOccupancy {
    #[serde(flatten)]
    pub slot: EventSlot,
    pub registered_count: i64,
}

/// List slots of an event
#[utoipa::path(get, path = "/events/{id}/slots", responses((status = OK, body = Vec<SlotOccupancy>)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
)
)]
async fn list_slots(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<SlotOccupancy>>, ApiError> {
    authorize(&enforcer, &claims, "slot", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    find_event(&mut conn, id).await?;
    let slots = event_slots::table
        .filter(event_slots::event_id.eq(id))
        .order((event_slots::floor.asc(), event_slots::counter.asc()))
        .select(EventSlot::as_select())
        .load::<EventSlot>(&mut conn)
        .await?;
    let occupancy = slot_occupancy(&mut conn, id).await?;
    Ok(Json(
        slots
            .into_iter()
            .map(|slot| SlotOccupancy {
                registered_count: occupancy.get(&slot.slot_id).copied().unwrap_or(0),
                slot,
            })
            .collect(),
    ))
}

/// Create slot
///
/// Registrants are spread randomly across an event's slots.
#[utoipa::path(post, path = "/events/{id}/slots", request_body = NewSlot, responses((status = CREATED, body = EventSlot)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
)
)]
async fn create_slot(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
    Json(ValidatedForm(slot)): Json<ValidatedForm<NewSlot>>,
) -> Result<(StatusCode, Json<EventSlot>), ApiError> {
    authorize(&enforcer, &claims, "slot", "create")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "slot", "create").await?;
    find_event(&mut conn, id).await?;
    let row = NewSlotRow {
        event_id: id,
        floor: slot.floor,
        counter: slot.counter,
        capacity: slot.capacity,
        time_start: slot.time_start,
        time_end: slot.time_end,
    };
    let created = insert_into(event_slots::table)
        .values(&row)
        .returning(EventSlot::as_returning())
        .get_result::<EventSlot>(&mut conn)
        .await
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                ApiError::DuplicateSlot
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                ApiError::EventNotFound
            }
            e => {
                tracing::debug!("create_slot: {}", e);
                ApiError::Database(e)
            }
        })?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Serialize, ToSchema, PartialEq)]
pub struct BatchCount {
    pub batch: String,
    pub count: i64,
}

#[derive(Debug, Serialize, ToSchema, PartialEq)]
pub struct CounterCount {
    pub counter_name: String,
    pub count: i64,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    /// Students served
    pub total: i64,
    pub by_batch: Vec<BatchCount>,
    pub by_counter: Vec<CounterCount>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolunteerStats {
    /// Coupons scanned by the volunteer
    pub total: i64,
    pub by_batch: Vec<BatchCount>,
}

const UNKNOWN_BATCH: &str = "Unknown";

pub fn counter_name(floor: &str, counter: i32) -> String {
    format!("{floor} - Counter {counter}")
}

/// Batch buckets sorted by count (desc) then name, and their sum.
pub fn batch_breakdown(rows: Vec<(Option<String>, i64)>) -> (i64, Vec<BatchCount>) {
    let mut merged: HashMap<String, i64> = HashMap::new();
    for (batch, count) in rows {
        *merged
            .entry(batch.unwrap_or_else(|| UNKNOWN_BATCH.to_string()))
            .or_default() += count;
    }
    let total = merged.values().sum();
    let mut buckets: Vec<BatchCount> = merged
        .into_iter()
        .map(|(batch, count)| BatchCount { batch, count })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.batch.cmp(&b.batch)));
    (total, buckets)
}

pub fn counter_breakdown(rows: Vec<(String, i32, i64)>) -> Vec<CounterCount> {
    let mut buckets: Vec<CounterCount> = rows
        .into_iter()
        .map(|(floor, counter, count)| CounterCount {
            counter_name: counter_name(&floor, counter),
            count,
        })
        .collect();
    buckets.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.counter_name.cmp(&b.counter_name))
    });
    buckets
}

/// Redemption statistics of an event
#[utoipa::path(get, path = "/events/{id}/stats", responses((status = OK, body = EventStats)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
)
)]
async fn event_stats(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
) -> Result<Json<EventStats>, ApiError> {
    authorize(&enforcer, &claims, "stats", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    find_event(&mut conn, id).await?;

    let batches = registrations::table
        .inner_join(users::table)
        .filter(registrations::event_id.eq(id))
        .filter(registrations::status.eq(RegistrationStatus::Served))
        .group_by(users::batch)
        .select((users::batch, count_star()))
        .load::<(Option<String>, i64)>(&mut conn)
        .await?;
    let counters = registrations::table
        .inner_join(event_slots::table)
        .filter(registrations::event_id.eq(id))
        .filter(registrations::status.eq(RegistrationStatus::Served))
        .group_by((event_slots::floor, event_slots::counter))
        .select((event_slots::floor, event_slots::counter, count_star()))
        .load::<(String, i32, i64)>(&mut conn)
        .await?;

    let (total, by_batch) = batch_breakdown(batches);
    Ok(Json(EventStats {
        total,
        by_batch,
        by_counter: counter_breakdown(counters),
    }))
}

/// Scan statistics of one volunteer for an event
#[utoipa::path(get, path = "/events/{id}/stats/volunteer/{volunteer_id}", responses((status = OK, body = VolunteerStats)), tag = EVENT_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "Event database id"),
    ("volunteer_id" = i32, Path, description = "Volunteer user id"),
)
)]
async fn volunteer_stats(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path((id, volunteer)): Path<(i32, i32)>,
) -> Result<Json<VolunteerStats>, ApiError> {
    authorize(&enforcer, &claims, "volunteer_stats", "read")?;
    if claims.role != Role::Admin && claims.sub != volunteer {
        return Err(ApiError::PermissionDenied);
    }
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    find_event(&mut conn, id).await?;

    let batches = volunteer_actions::table
        .inner_join(registrations::table.inner_join(users::table))
        .filter(volunteer_actions::volunteer_id.eq(volunteer))
        .filter(volunteer_actions::action.eq(VolunteerAction::Scan))
        .filter(registrations::event_id.eq(id))
        .group_by(users::batch)
        .select((users::batch, count_star()))
        .load::<(Option<String>, i64)>(&mut conn)
        .await?;

    let (total, by_batch) = batch_breakdown(batches);
    Ok(Json(VolunteerStats { total, by_batch }))
}
