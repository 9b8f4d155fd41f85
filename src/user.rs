use axum::extract::{Path, Query, State};
use axum::Json;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::auth::{authorize, authorize_current, Claims};
use crate::error::ApiError;
use crate::model::{Role, RoleUpdate, User};
use crate::schema::users::dsl::*;
use crate::USER_TAG;

/// expose the user OpenAPI to parent module
pub fn user_router() -> OpenApiRouter<crate::State> {
    OpenApiRouter::new()
        .routes(routes!(me))
        .routes(routes!(list_users))
        .routes(routes!(update_role))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserFilter {
    /// Only users with this role
    pub role: Option<Role>,
}

/// Current user
#[utoipa::path(get, path = "/users/me", responses((status = OK, body = User)), tag = USER_TAG, security(
    ("session_jwt" = [])
))]
async fn me(
    claims: Claims,
    State(crate::State { pool, .. }): State<crate::State>,
) -> Result<Json<User>, ApiError> {
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let user = users
        .find(claims.sub)
        .select(User::as_select())
        .first::<User>(&mut conn)
        .await
        .optional()?
        .ok_or(ApiError::UserNotFound)?;
    Ok(Json(user))
}

/// List users
#[utoipa::path(get, path = "/users", responses((status = OK, body = Vec<User>)), tag = USER_TAG, security(
    ("session_jwt" = [])
),
params(UserFilter)
)]
async fn list_users(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<User>>, ApiError> {
    authorize(&enforcer, &claims, "user", "read")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    let mut query = users.select(User::as_select()).order(name.asc()).into_boxed();
    if let Some(wanted) = filter.role {
        query = query.filter(role.eq(wanted));
    }
    let found = query.load::<User>(&mut conn).await.map_err(|e| {
        tracing::debug!("list_users: {}", e);
        ApiError::Database(e)
    })?;
    Ok(Json(found))
}

/// Change a user's role
#[utoipa::path(patch, path = "/users/{id}", request_body = RoleUpdate, responses((status = OK, body = User)), tag = USER_TAG, security(
    ("session_jwt" = [])
),
params(
    ("id" = i32, Path, description = "User database id"),
)
)]
async fn update_role(
    claims: Claims,
    State(crate::State { pool, enforcer, .. }): State<crate::State>,
    Path(id): Path<i32>,
    Json(RoleUpdate { role: new_role }): Json<RoleUpdate>,
) -> Result<Json<User>, ApiError> {
    authorize(&enforcer, &claims, "user", "update")?;
    let mut conn = pool.get().await.map_err(|_| ApiError::DbConnection)?;
    authorize_current(&enforcer, &mut conn, &claims, "user", "update").await?;
    let user = diesel::update(users.find(id))
        .set(role.eq(new_role))
        .returning(User::as_returning())
        .get_result::<User>(&mut conn)
        .await
        .optional()?
        .ok_or(ApiError::UserNotFound)?;
    tracing::info!("user {} is now {}", user.user_id, user.role);
    Ok(Json(user))
}
