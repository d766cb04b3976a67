use axum::{extract::State, Json};
use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;
use tracing::info;

use crate::{
    activity::{self, Subject},
    auth::{password, AuthenticatedUser},
    error::{AppError, AppResult},
    models::{User, UserChangeset},
    routes::auth::UserProfile,
    schema::{refresh_tokens, users},
    state::AppState,
    utils::json::{nullable_text, required_text},
};

const READ_ONLY_FIELDS: [&str; 3] = ["username", "role", "account_type"];

pub async fn get_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserProfile>> {
    let mut conn = state.db()?;
    let record: User = users::table
        .find(user.user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;
    Ok(Json(record.into()))
}

pub async fn update_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<UserProfile>> {
    if let Some(field) = READ_ONLY_FIELDS
        .iter()
        .find(|field| body.get(**field).is_some())
    {
        return Err(AppError::bad_request(format!("{field} cannot be changed")));
    }

    let email = required_text(&body, "email").map_err(AppError::bad_request)?;
    if email.as_deref().is_some_and(|email| !email.contains('@')) {
        return Err(AppError::bad_request("a valid email is required"));
    }

    let mut conn = state.db()?;
    let record: User = users::table
        .find(user.user_id)
        .first(&mut conn)
        .optional()?
        .ok_or_else(AppError::unauthorized)?;

    let password_hash = match new_password(&body)? {
        Some(change) => {
            let verified = password::verify_password(change.current, &record.password_hash)
                .map_err(|_| AppError::bad_request("current password is incorrect"))?;
            if !verified {
                return Err(AppError::bad_request("current password is incorrect"));
            }
            Some(password::hash_password(change.new)?)
        }
        None => None,
    };
    let password_changed = password_hash.is_some();

    let now = Utc::now().naive_utc();
    let changeset = UserChangeset {
        email,
        first_name: nullable_text(&body, "first_name").map_err(AppError::bad_request)?,
        last_name: nullable_text(&body, "last_name").map_err(AppError::bad_request)?,
        password_hash,
        updated_at: now,
    };

    if changeset.email.is_none()
        && changeset.first_name.is_none()
        && changeset.last_name.is_none()
        && !password_changed
    {
        return Ok(Json(record.into()));
    }

    let updated = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let updated: User = diesel::update(users::table.find(user.user_id))
            .set(&changeset)
            .get_result(conn)?;
        if password_changed {
            diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::user_id.eq(user.user_id))
                    .filter(refresh_tokens::revoked_at.is_null()),
            )
            .set((
                refresh_tokens::revoked_at.eq(now),
                refresh_tokens::updated_at.eq(now),
            ))
            .execute(conn)?;
        }
        Ok(updated)
    })?;

    info!(
        user_id = %user.user_id,
        password_changed,
        "profile updated"
    );
    activity::record(
        &mut conn,
        user.user_id,
        activity::PROFILE_UPDATE,
        if password_changed {
            "Updated profile and password"
        } else {
            "Updated profile"
        },
        Subject::default(),
    );

    Ok(Json(updated.into()))
}

struct PasswordChange<'a> {
    current: &'a str,
    new: &'a str,
}

fn new_password(body: &Value) -> AppResult<Option<PasswordChange<'_>>> {
    let Some(new) = body.get("new_password") else {
        return Ok(None);
    };
    let new = password_field(Some(new), "new_password")?;
    let current = password_field(body.get("current_password"), "current_password")?;
    let confirm = password_field(body.get("confirm_password"), "confirm_password")?;

    if new != confirm {
        return Err(AppError::bad_request("passwords do not match"));
    }
    password::check_password_length(new).map_err(AppError::bad_request)?;
    Ok(Some(PasswordChange { current, new }))
}

fn password_field<'a>(value: Option<&'a Value>, field: &str) -> AppResult<&'a str> {
    value
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request(format!("{field} is required")))
}
