pub mod auth;
mod config;
mod error;
pub mod event;
mod model;
pub mod registration;
mod schema;
pub mod session;
pub mod user;
pub mod validate;


use std::net::Ipv4Addr;
use std::sync::Arc;

use auth::{GoogleVerifier, IdentityVerifier, Keys, SecurityAddon};
use axum::http::HeaderValue;
use axum::Router;
use casbin::{CoreApi, DefaultModel, Enforcer, FileAdapter};
use config::Config;
use diesel::{pg::Pg, Connection, PgConnection};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

const AUTH_TAG: &str = "auth";
const USER_TAG: &str = "user";
const EVENT_TAG: &str = "event";
const REGISTRATION_TAG: &str = "registration";

type Pool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct State {
    pool: Pool,
    enforcer: Arc<Enforcer>,
    keys: Arc<Keys>,
    config: Arc<Config>,
    verifier: Arc<dyn IdentityVerifier>,
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    tags(
        (name = AUTH_TAG, description = "Sign-in endpoints"),
        (name = USER_TAG, description = "User management endpoints"),
        (name = EVENT_TAG, description = "Event, slot and statistics endpoints"),
        (name = REGISTRATION_TAG, description = "Coupon registration and scanning endpoints")
    )
)]
struct ApiDoc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

fn run_migrations(
    connection: &mut impl MigrationHarness<Pg>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    connection.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}

async fn load_enforcer(model_path: &str, policy_path: &str) -> casbin::Result<Enforcer> {
    let model = DefaultModel::from_file(model_path).await?;
    let adapter = FileAdapter::new(policy_path.to_string());
    Enforcer::new(model, adapter).await
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match config
        .cors_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    {
        Some(origin) => layer.allow_origin(origin),
        None => layer.allow_origin(Any),
    }
}

fn app(state: State) -> Router {
    let cors = cors_layer(&state.config);
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(session::auth_router())
        .merge(user::user_router())
        .merge(event::event_router())
        .merge(event::slot_router())
        .merge(event::stats_router())
        .merge(registration::registration_router())
        .with_state(state)
        .split_for_parts();

    router
        .merge(SwaggerUi::new("/swagger-ui").url("/apidoc/openapi.json", api))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_filter(filter),
        )
        .init();

    let config = Config::from_env()?;

    let mut migration_connection = PgConnection::establish(&config.database_url)?;
    run_migrations(&mut migration_connection).map_err(|e| e as Box<dyn std::error::Error>)?;
    drop(migration_connection);
    info!("Migrations applied");

    // set up connection pool
    let manager =
        AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.database_url.clone());
    let pool = bb8::Pool::builder().build(manager).await?;
    let enforcer = load_enforcer(&config.acl_model, &config.acl_policy).await?;

    let port = config.port;
    let state = State {
        pool,
        enforcer: Arc::new(enforcer),
        keys: Arc::new(Keys::new(&config.jwt_secret)),
        verifier: Arc::new(GoogleVerifier::new(config.google_client_id.clone())),
        config: Arc::new(config),
    };

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    info!("Listening on 0.0.0.0:{}", port);
    Ok(axum::serve(listener, app(state)).await?)
}
