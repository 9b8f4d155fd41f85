use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, Output, ToSql};
use diesel::sql_types::Text;
use diesel::{AsChangeset, AsExpression, FromSqlRow, Insertable, Queryable, Selectable};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use crate::schema::{event_slots, events, registrations, users, volunteer_actions};

#[derive(Error, Debug)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

/// Enum stored as its snake_case name in a text column guarded by a CHECK constraint.
macro_rules! pg_text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema,
            AsExpression, FromSqlRow,
        )]
        #[diesel(sql_type = Text)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), out)
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let text = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                Ok(text.parse()?)
            }
        }
    };
}

pg_text_enum! {
    Role {
        Student => "student",
        Volunteer => "volunteer",
        Admin => "admin",
    }
}

pg_text_enum! {
    EventStatus {
        Active => "active",
        Completed => "completed",
        Cancelled => "cancelled",
        Closed => "closed",
    }
}

pg_text_enum! {
    /// Coupon lifecycle: `registered` until scanned (`served`) or the event ends (`expired`).
    RegistrationStatus {
        Registered => "registered",
        Served => "served",
        Expired => "expired",
    }
}

pg_text_enum! {
    VolunteerAction {
        Scan => "scan",
        MarkServed => "mark_served",
    }
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(Pg))]
pub struct User {
    pub user_id: i32,
    pub name: String,
    #[serde(skip)]
    pub google_id: Option<String>,
    pub email: String,
    pub role: Role,
    pub batch: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = users)]
pub struct NewUserRow {
    pub name: String,
    pub google_id: Option<String>,
    pub email: String,
    pub role: Role,
    pub batch: Option<String>,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(Pg))]
pub struct Event {
    pub event_id: i32,
    pub name: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub status: EventStatus,
    pub created_by: Option<i32>,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = events)]
pub struct NewEventRow {
    pub name: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub status: EventStatus,
    pub created_by: Option<i32>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = events)]
pub struct EventChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub status: Option<EventStatus>,
}

impl EventChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.date.is_none()
            && self.status.is_none()
    }
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = event_slots)]
#[diesel(check_for_backend(Pg))]
pub struct EventSlot {
    pub slot_id: i32,
    pub event_id: i32,
    pub floor: String,
    pub counter: i32,
    pub capacity: i32,
    pub time_start: NaiveDateTime,
    pub time_end: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = event_slots)]
pub struct NewSlotRow {
    pub event_id: i32,
    pub floor: String,
    pub counter: i32,
    pub capacity: i32,
    pub time_start: NaiveDateTime,
    pub time_end: NaiveDateTime,
}

#[derive(ToSchema, Serialize, Selectable, Queryable, Debug, Clone)]
#[diesel(table_name = registrations)]
#[diesel(check_for_backend(Pg))]
pub struct Registration {
    pub registration_id: i32,
    pub student_id: i32,
    pub event_id: i32,
    pub slot_id: i32,
    pub qr_token: String,
    pub status: RegistrationStatus,
    pub created_at: NaiveDateTime,
    pub served_at: Option<NaiveDateTime>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = registrations)]
pub struct NewRegistrationRow {
    pub student_id: i32,
    pub event_id: i32,
    pub slot_id: i32,
    pub qr_token: String,
    pub status: RegistrationStatus,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = volunteer_actions)]
pub struct NewVolunteerActionRow {
    pub volunteer_id: i32,
    pub registration_id: i32,
    pub action: VolunteerAction,
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
pub struct NewEvent {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub description: Option<String>,
    #[serde(deserialize_with = "de_date")]
    #[schema(value_type = String, example = "2024-11-20")]
    pub date: NaiveDate,
    pub status: Option<EventStatus>,
}

#[derive(Deserialize, ToSchema, Debug, Validate, Default)]
pub struct EventPatch {
    #[validate(length(min = 1, max = 100))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "de_opt_date")]
    #[schema(value_type = Option<String>, example = "2024-11-20")]
    pub date: Option<NaiveDate>,
    pub status: Option<EventStatus>,
}

impl From<EventPatch> for EventChanges {
    fn from(patch: EventPatch) -> Self {
        EventChanges {
            name: patch.name,
            description: patch.description,
            date: patch.date,
            status: patch.status,
        }
    }
}

#[derive(Deserialize, ToSchema, Debug, Validate)]
#[validate(schema(function = "slot_window_is_ordered"))]
pub struct NewSlot {
    #[validate(length(min = 1, max = 50))]
    pub floor: String,
    #[validate(range(min = 1))]
    pub counter: i32,
    #[validate(range(min = 1))]
    pub capacity: i32,
    #[serde(deserialize_with = "de_timestamp")]
    #[schema(value_type = String, example = "2024-11-20 12:00:00")]
    pub time_start: NaiveDateTime,
    #[serde(deserialize_with = "de_timestamp")]
    #[schema(value_type = String, example = "2024-11-20 14:00:00")]
    pub time_end: NaiveDateTime,
}

fn slot_window_is_ordered(slot: &NewSlot) -> Result<(), ValidationError> {
    if slot.time_end > slot.time_start {
        Ok(())
    } else {
        Err(ValidationError::new("time_end must be later than time_start"))
    }
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct RoleUpdate {
    pub role: Role,
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp, keeping only the date.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.naive_local()))
}

fn de_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_date(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid date `{raw}`")))
}

fn de_opt_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<NaiveDate>, D::Error> {
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_date(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date `{raw}`"))),
        None => Ok(None),
    }
}

fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp `{raw}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn statuses_round_trip_through_text() {
        for status in [
            EventStatus::Active,
            EventStatus::Completed,
            EventStatus::Cancelled,
            EventStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<EventStatus>().unwrap(), status);
        }
        assert_eq!(VolunteerAction::MarkServed.as_str(), "mark_served");
        assert!("deleted".parse::<EventStatus>().is_err());
    }

    #[test]
    fn serde_uses_the_stored_names() {
        assert_eq!(
            serde_json::to_value(RegistrationStatus::Served).unwrap(),
            json!("served")
        );
        let role: Role = serde_json::from_value(json!("volunteer")).unwrap();
        assert_eq!(role, Role::Volunteer);
    }

    #[test]
    fn event_date_accepts_frontend_iso_strings() {
        let expected = NaiveDate::from_ymd_opt(2024, 11, 20).unwrap();
        assert_eq!(parse_date("2024-11-20"), Some(expected));
        assert_eq!(parse_date("2024-11-20T00:00:00.000Z"), Some(expected));
        assert_eq!(parse_date("20/11/2024"), None);
    }

    #[test]
    fn slot_times_accept_space_or_t_separator() {
        let expected = NaiveDate::from_ymd_opt(2024, 11, 20)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-11-20 12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-11-20T12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-11-20 12:30"), Some(expected));
        assert_eq!(parse_timestamp("noon"), None);
    }

    #[test]
    fn new_event_rejects_empty_name() {
        let event: NewEvent =
            serde_json::from_value(json!({ "name": "", "date": "2024-11-20" })).unwrap();
        assert!(event.validate().is_err());
        assert!(event.status.is_none());
    }

    #[test]
    fn slot_window_must_be_ordered() {
        let slot: NewSlot = serde_json::from_value(json!({
            "floor": "1st Floor",
            "counter": 1,
            "capacity": 50,
            "time_start": "2024-11-20 14:00:00",
            "time_end": "2024-11-20 12:00:00",
        }))
        .unwrap();
        assert!(slot.validate().is_err());

        let slot: NewSlot = serde_json::from_value(json!({
            "floor": "1st Floor",
            "counter": 2,
            "capacity": 50,
            "time_start": "2024-11-20 12:00:00",
            "time_end": "2024-11-20 14:00:00",
        }))
        .unwrap();
        assert!(slot.validate().is_ok());
    }

    #[test]
    fn slot_capacity_must_be_positive() {
        let slot: NewSlot = serde_json::from_value(json!({
            "floor": "Ground",
            "counter": 1,
            "capacity": 0,
            "time_start": "2024-11-20 12:00:00",
            "time_end": "2024-11-20 14:00:00",
        }))
        .unwrap();
        assert!(slot.validate().is_err());
    }

    #[test]
    fn empty_patch_has_no_changes() {
        assert!(EventChanges::from(EventPatch::default()).is_empty());
        let patch: EventPatch = serde_json::from_value(json!({ "status": "closed" })).unwrap();
        let changes = EventChanges::from(patch);
        assert!(!changes.is_empty());
        assert_eq!(changes.status, Some(EventStatus::Closed));
    }
}
