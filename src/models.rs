use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::files::{EntityKind, FileKind};
use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub account_type: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl User {
    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if full.trim().is_empty() {
            self.username.clone()
        } else {
            full
        }
    }
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = users)]
pub struct UserChangeset {
    pub email: Option<String>,
    pub first_name: Option<Option<String>>,
    pub last_name: Option<Option<String>>,
    pub password_hash: Option<String>,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub account_type: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = refresh_tokens)]
#[diesel(belongs_to(User))]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = refresh_tokens)]
pub struct NewRefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub issued_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = machines)]
pub struct Machine {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub series: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub department: Option<String>,
    pub machine_type: Option<String>,
    pub owner_id: Uuid,
    pub is_public: bool,
    pub is_template: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = machines)]
pub struct NewMachine {
    pub id: Uuid,
    pub name: String,
    pub model: String,
    pub series: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub department: Option<String>,
    pub machine_type: Option<String>,
    pub owner_id: Uuid,
    pub is_public: bool,
    pub is_template: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = machine_copies)]
pub struct MachineCopy {
    pub id: Uuid,
    pub original_template_id: Option<Uuid>,
    pub user_id: Uuid,
    pub machine_id: Uuid,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = machine_copies)]
pub struct NewMachineCopy {
    pub id: Uuid,
    pub original_template_id: Option<Uuid>,
    pub user_id: Uuid,
    pub machine_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = hidden_templates)]
pub struct NewHiddenTemplate {
    pub user_id: Uuid,
    pub machine_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = issues)]
#[diesel(belongs_to(Machine))]
pub struct Issue {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub title: String,
    pub description: String,
    pub error_code: Option<String>,
    pub keywords: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = issues)]
pub struct NewIssue {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub title: String,
    pub description: String,
    pub error_code: Option<String>,
    pub keywords: String,
    pub created_by: Option<Uuid>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = solutions)]
#[diesel(belongs_to(Issue))]
pub struct Solution {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub description: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = solutions)]
pub struct NewSolution {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub description: String,
    pub created_by: Option<Uuid>,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = guides)]
#[diesel(belongs_to(Solution))]
pub struct Guide {
    pub id: Uuid,
    pub solution_id: Uuid,
    pub title: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = guides)]
pub struct NewGuide {
    pub id: Uuid,
    pub solution_id: Uuid,
    pub title: String,
    pub created_by: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = steps)]
#[diesel(belongs_to(Guide))]
pub struct Step {
    pub id: Uuid,
    pub guide_id: Uuid,
    pub step_number: i32,
    pub description: String,
    pub video_urls: Vec<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = steps)]
pub struct NewStep {
    pub id: Uuid,
    pub guide_id: Uuid,
    pub step_number: i32,
    pub description: String,
    pub video_urls: Vec<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = managed_files)]
pub struct ManagedFile {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub file_kind: FileKind,
    pub s3_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = managed_files)]
pub struct NewManagedFile {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub file_kind: FileKind,
    pub s3_key: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = activity_logs)]
pub struct ActivityLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub activity_type: String,
    pub description: String,
    pub machine_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = activity_logs)]
pub struct NewActivityLog {
    pub id: Uuid,
    pub user_id: Uuid,
    pub activity_type: String,
    pub description: String,
    pub machine_id: Option<Uuid>,
    pub issue_id: Option<Uuid>,
}
