use diesel::{prelude::*, PgConnection};
use tracing::warn;
use uuid::Uuid;

use crate::{
    models::{ActivityLog, NewActivityLog},
    schema::activity_logs,
};

pub const MACHINE_VIEW: &str = "MACHINE_VIEW";
pub const MACHINE_CREATE: &str = "MACHINE_CREATE";
pub const MACHINE_UPDATE: &str = "MACHINE_UPDATE";
pub const MACHINE_COPY: &str = "MACHINE_COPY";
pub const ISSUE_VIEW: &str = "ISSUE_VIEW";
pub const ISSUE_CREATE: &str = "ISSUE_CREATE";
pub const ISSUE_UPDATE: &str = "ISSUE_UPDATE";
pub const SOLUTION_CREATE: &str = "SOLUTION_CREATE";
pub const SOLUTION_UPDATE: &str = "SOLUTION_UPDATE";
pub const GUIDE_CREATE: &str = "GUIDE_CREATE";
pub const GUIDE_UPDATE: &str = "GUIDE_UPDATE";
pub const PROFILE_UPDATE: &str = "PROFILE_UPDATE";

pub const DEFAULT_LIMIT: i64 = 20;
pub const MAX_LIMIT: i64 = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct Subject {
    pub machine_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
}

impl Subject {
    pub fn machine(machine_id: Uuid) -> Self {
        Self {
            machine_id: Some(machine_id),
            issue_id: None,
        }
    }

    pub fn issue(machine_id: Uuid, issue_id: Uuid) -> Self {
        Self {
            machine_id: Some(machine_id),
            issue_id: Some(issue_id),
        }
    }
}

pub fn record(
    conn: &mut PgConnection,
    user_id: Uuid,
    activity_type: &str,
    description: impl Into<String>,
    subject: Subject,
) {
    let entry = NewActivityLog {
        id: Uuid::new_v4(),
        user_id,
        activity_type: activity_type.to_string(),
        description: description.into(),
        machine_id: subject.machine_id,
        issue_id: subject.issue_id,
    };

    if let Err(err) = diesel::insert_into(activity_logs::table)
        .values(&entry)
        .execute(conn)
    {
        warn!(
            user_id = %user_id,
            activity_type,
            error = %err,
            "failed to record activity"
        );
    }
}

pub fn clamp_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub fn recent(conn: &mut PgConnection, user_id: Uuid, limit: i64) -> QueryResult<Vec<ActivityLog>> {
    activity_logs::table
        .filter(activity_logs::user_id.eq(user_id))
        .order((activity_logs::created_at.desc(), activity_logs::id.desc()))
        .limit(limit)
        .load(conn)
}
