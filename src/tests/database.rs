//! End-to-end flows against Postgres. They run only when `TEST_DATABASE_URL`
//! names a scratch database; without it every test returns early.
//!
//! Each test creates its own users and events, so the tests can share one
//! database and run in parallel.

use std::sync::Once;

use axum::http::StatusCode;
use chrono::Duration;
use diesel::dsl::count_star;
use diesel::{Connection, ExpressionMethods, PgConnection, QueryDsl, SelectableHelper};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::{json, Value};
use tokio::task::JoinSet;

use super::{assemble, config, request, send, StubVerifier};
use crate::model::{NewUserRow, Role, User};
use crate::registration::generate_token;
use crate::schema::{registrations, users};
use crate::{run_migrations, State};

static MIGRATE: Once = Once::new();

async fn database() -> Option<State> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL is not set, skipping");
        return None;
    };
    MIGRATE.call_once(|| {
        let mut conn = PgConnection::establish(&url).expect("TEST_DATABASE_URL is reachable");
        run_migrations(&mut conn).expect("migrations apply");
    });
    let mut config = config();
    config.database_url = url.clone();
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    let pool = bb8::Pool::builder()
        .max_size(8)
        .build(manager)
        .await
        .unwrap();
    Some(assemble(config, pool, StubVerifier { email: None }).await)
}

/// Inserts a user with a unique email and returns it with a session token.
async fn user(state: &State, role: Role, batch: Option<&str>) -> (User, String) {
    let mut conn = state.pool.get().await.unwrap();
    let user = diesel::insert_into(users::table)
        .values(&NewUserRow {
            name: format!("{role} tester"),
            google_id: None,
            email: format!("{}@iiitkottayam.ac.in", generate_token()),
            role,
            batch: batch.map(str::to_string),
        })
        .returning(User::as_returning())
        .get_result::<User>(&mut conn)
        .await
        .unwrap();
    let token = state.keys.issue(&user, Duration::hours(1)).unwrap();
    (user, token)
}

async fn event_on(state: &State, admin: &str, date: &str) -> i64 {
    let (status, body) = send(
        state.clone(),
        request(
            "POST",
            "/events",
            Some(admin),
            Some(json!({ "name": "Onam Sadya", "date": date })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["event_id"].as_i64().unwrap()
}

async fn event(state: &State, admin: &str) -> i64 {
    event_on(state, admin, "2099-09-15").await
}

async fn slot(
    state: &State,
    admin: &str,
    event: i64,
    counter: i32,
    capacity: i32,
) -> (StatusCode, Value) {
    send(
        state.clone(),
        request(
            "POST",
            &format!("/events/{event}/slots"),
            Some(admin),
            Some(json!({
                "floor": "1st Floor",
                "counter": counter,
                "capacity": capacity,
                "time_start": "2099-09-15 12:00:00",
                "time_end": "2099-09-15 14:00:00",
            })),
        ),
    )
    .await
}

async fn register(state: &State, token: &str, event: i64) -> (StatusCode, Value) {
    send(
        state.clone(),
        request(
            "POST",
            "/registrations",
            Some(token),
            Some(json!({ "event_id": event })),
        ),
    )
    .await
}

async fn scan(state: &State, token: &str, qr_token: &str) -> (StatusCode, Value) {
    send(
        state.clone(),
        request(
            "POST",
            "/registrations/scan",
            Some(token),
            Some(json!({ "qr_token": qr_token })),
        ),
    )
    .await
}

async fn get(state: &State, token: &str, uri: &str) -> (StatusCode, Value) {
    send(state.clone(), request("GET", uri, Some(token), None)).await
}

#[tokio::test]
async fn coupon_is_issued_redeemed_and_counted() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (student, student_token) = user(&state, Role::Student, Some("2024")).await;
    let (volunteer, volunteer_token) = user(&state, Role::Volunteer, None).await;
    let event = event(&state, &admin).await;

    let (status, body) = register(&state, &student_token, event).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "No slots defined. Admin must add a slot first.");

    let (status, _) = slot(&state, &admin, event, 2, 10).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = slot(&state, &admin, event, 2, 10).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = register(&state, &student_token, event).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["message"], "Registration successful");
    let qr_token = body["data"]["qr_token"].as_str().unwrap().to_string();
    assert_eq!(qr_token.len(), 32);

    let (status, body) = register(&state, &student_token, event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Existing registration retrieved");
    assert_eq!(body["data"]["qr_token"], qr_token.as_str());

    let (status, body) = scan(&state, &volunteer_token, &format!(" {qr_token} ")).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["student_id"], student.user_id);
    assert_eq!(body["batch"], "2024");

    let (status, body) = scan(&state, &volunteer_token, &qr_token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Student already served");

    let (status, body) = register(&state, &student_token, event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["isRedeemed"], true);

    let (status, stats) = get(&state, &admin, &format!("/events/{event}/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        stats,
        json!({
            "total": 1,
            "byBatch": [{ "batch": "2024", "count": 1 }],
            "byCounter": [{ "counter_name": "1st Floor - Counter 2", "count": 1 }],
        })
    );

    let uri = format!("/events/{event}/stats/volunteer/{}", volunteer.user_id);
    let (status, stats) = get(&state, &volunteer_token, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 1);

    let (status, slots) = get(&state, &volunteer_token, &format!("/events/{event}/slots")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(slots[0]["registered_count"], 1);

    let (status, mine) = get(&state, &student_token, "/registrations/me").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["status"], "served");
    assert!(mine[0]["qr_token"].is_null());
    assert_eq!(mine[0]["counter"], 2);
}

#[tokio::test]
async fn unknown_tokens_are_rejected() {
    let Some(state) = database().await else {
        return;
    };
    let (_, volunteer) = user(&state, Role::Volunteer, None).await;
    let (status, body) = scan(&state, &volunteer, &generate_token()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Invalid QR Token");
}

#[tokio::test]
async fn completing_an_event_expires_its_coupons() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (_, student) = user(&state, Role::Student, Some("2023")).await;
    let (_, volunteer) = user(&state, Role::Volunteer, None).await;
    let event = event(&state, &admin).await;
    slot(&state, &admin, event, 1, 10).await;

    let (_, body) = register(&state, &student, event).await;
    let qr_token = body["data"]["qr_token"].as_str().unwrap().to_string();

    let (status, body) = send(
        state.clone(),
        request(
            "PATCH",
            &format!("/events/{event}"),
            Some(&admin),
            Some(json!({ "status": "completed" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");

    let (status, body) = scan(&state, &volunteer, &qr_token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Coupon expired");

    let (status, body) = register(&state, &student, event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "expired");
    assert!(body["data"]["qr_token"].is_null());

    let (_, other) = user(&state, Role::Student, None).await;
    let (status, body) = register(&state, &other, event).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Event is not open for registration");
}

#[tokio::test]
async fn closing_an_event_keeps_it_listed() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let event = event(&state, &admin).await;

    let (status, body) = send(
        state.clone(),
        request("DELETE", &format!("/events/{event}"), Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "closed");

    let (_, all) = get(&state, &admin, "/events").await;
    let listed = all
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["event_id"] == event)
        .unwrap();
    assert_eq!(listed["status"], "closed");

    let (status, _) = send(
        state.clone(),
        request("DELETE", "/events/2147483647", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn active_listing_shows_upcoming_events_with_the_viewers_coupon() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (student, student_token) = user(&state, Role::Student, None).await;
    let upcoming = event(&state, &admin).await;
    let past = event_on(&state, &admin, "2000-01-01").await;
    slot(&state, &admin, upcoming, 3, 10).await;
    let (_, body) = register(&state, &student_token, upcoming).await;
    let qr_token = body["data"]["qr_token"].clone();

    let (status, active) = get(&state, &student_token, "/events/active").await;
    assert_eq!(status, StatusCode::OK);
    let active = active.as_array().unwrap();
    assert!(active.iter().all(|e| e["event_id"] != past));
    let mine = active.iter().find(|e| e["event_id"] == upcoming).unwrap();
    assert_eq!(mine["qr_token"], qr_token);
    assert_eq!(mine["registration_status"], "registered");
    assert_eq!(mine["counter"], 3);

    // admins look at a student through the query string
    let uri = format!("/events/active?student_id={}", student.user_id);
    let (_, active) = get(&state, &admin, &uri).await;
    let seen = active
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["event_id"] == upcoming)
        .unwrap()
        .clone();
    assert_eq!(seen["qr_token"], qr_token);

    let (_, active) = get(&state, &admin, "/events/active").await;
    let bare = active
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["event_id"] == upcoming)
        .unwrap()
        .clone();
    assert!(bare["registration_id"].is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_holds_under_concurrent_registration() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let event = event(&state, &admin).await;
    slot(&state, &admin, event, 1, 5).await;

    let mut students = Vec::new();
    for _ in 0..20 {
        students.push(user(&state, Role::Student, None).await.1);
    }
    let mut attempts = JoinSet::new();
    for token in students {
        let state = state.clone();
        attempts.spawn(async move { register(&state, &token, event).await.0 });
    }
    let mut statuses = Vec::new();
    while let Some(status) = attempts.join_next().await {
        statuses.push(status.unwrap());
    }

    let created = statuses.iter().filter(|s| **s == StatusCode::CREATED).count();
    let full = statuses.iter().filter(|s| **s == StatusCode::CONFLICT).count();
    assert_eq!((created, full), (5, 15), "{statuses:?}");

    let (_, slots) = get(&state, &admin, &format!("/events/{event}/slots")).await;
    assert_eq!(slots[0]["registered_count"], 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_of_one_student_share_a_coupon() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (student, token) = user(&state, Role::Student, None).await;
    let event = event(&state, &admin).await;
    slot(&state, &admin, event, 1, 50).await;

    let mut attempts = JoinSet::new();
    for _ in 0..4 {
        let state = state.clone();
        let token = token.clone();
        attempts.spawn(async move { register(&state, &token, event).await.0 });
    }
    let mut statuses = Vec::new();
    while let Some(status) = attempts.join_next().await {
        statuses.push(status.unwrap());
    }
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::CREATED).count(),
        1,
        "{statuses:?}"
    );
    assert!(statuses
        .iter()
        .all(|s| [StatusCode::CREATED, StatusCode::OK, StatusCode::CONFLICT].contains(s)));

    let mut conn = state.pool.get().await.unwrap();
    let rows = registrations::table
        .filter(registrations::student_id.eq(student.user_id))
        .filter(registrations::event_id.eq(event as i32))
        .select(count_star())
        .first::<i64>(&mut conn)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_coupon_is_served_once_under_concurrent_scans() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (_, student) = user(&state, Role::Student, None).await;
    let (volunteer, volunteer_token) = user(&state, Role::Volunteer, None).await;
    let event = event(&state, &admin).await;
    slot(&state, &admin, event, 1, 10).await;
    let (_, body) = register(&state, &student, event).await;
    let qr_token = body["data"]["qr_token"].as_str().unwrap().to_string();

    let mut scans = JoinSet::new();
    for _ in 0..6 {
        let state = state.clone();
        let token = volunteer_token.clone();
        let qr_token = qr_token.clone();
        scans.spawn(async move { scan(&state, &token, &qr_token).await.0 });
    }
    let mut statuses = Vec::new();
    while let Some(status) = scans.join_next().await {
        statuses.push(status.unwrap());
    }
    statuses.sort_by_key(StatusCode::as_u16);
    assert_eq!(statuses, [vec![StatusCode::OK], vec![StatusCode::BAD_REQUEST; 5]].concat());

    let uri = format!("/events/{event}/stats/volunteer/{}", volunteer.user_id);
    let (_, stats) = get(&state, &admin, &uri).await;
    assert_eq!(stats["total"], 1);
}

#[tokio::test]
async fn demoted_volunteers_stop_scanning_before_their_token_expires() {
    let Some(state) = database().await else {
        return;
    };
    let (_, admin) = user(&state, Role::Admin, None).await;
    let (volunteer, volunteer_token) = user(&state, Role::Volunteer, None).await;

    let (status, body) = send(
        state.clone(),
        request(
            "PATCH",
            &format!("/users/{}", volunteer.user_id),
            Some(&admin),
            Some(json!({ "role": "student" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "student");

    let (status, body) = scan(&state, &volunteer_token, &generate_token()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Permission denied");
}
