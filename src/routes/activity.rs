use axum::{
    extract::{Query, State},
    Json,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    activity, auth::AuthenticatedUser, error::AppResult, models::ActivityLog, state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub activity_type: String,
    pub description: String,
    pub machine_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

impl From<ActivityLog> for ActivityEntry {
    fn from(log: ActivityLog) -> Self {
        Self {
            id: log.id,
            activity_type: log.activity_type,
            description: log.description,
            machine_id: log.machine_id,
            issue_id: log.issue_id,
            created_at: log.created_at,
        }
    }
}

pub async fn list_activity(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<ActivityQuery>,
) -> AppResult<Json<Vec<ActivityEntry>>> {
    let mut conn = state.db()?;
    let entries = activity::recent(&mut conn, user.user_id, activity::clamp_limit(query.limit))?;
    Ok(Json(entries.into_iter().map(ActivityEntry::from).collect()))
}
