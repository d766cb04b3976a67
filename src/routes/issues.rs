use std::collections::HashMap;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    access::{self, Access},
    activity::{self, Subject},
    auth::AuthenticatedUser,
    cleanup::{self, DeleteRoot},
    error::{AppError, AppResult},
    files::{self, EntityKind, EntityRef, FileKind},
    graph::{self, IssueNode},
    matching,
    models::{Issue, ManagedFile, NewIssue},
    routes::{
        files::{self as file_routes, FileRef},
        solutions::SolutionResponse,
    },
    schema::issues,
    state::AppState,
    utils::json::{nullable_text, required_text},
};

#[derive(Debug, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub description: String,
    pub error_code: Option<String>,
    #[serde(default)]
    pub keywords: String,
}

#[derive(Debug, Deserialize)]
pub struct MatchRequest {
    pub description: String,
    pub machine_id: Uuid,
}

#[derive(Serialize)]
pub struct MatchResponse {
    pub matching_issues: Vec<IssueResponse>,
}

#[derive(AsChangeset)]
#[diesel(table_name = issues)]
struct IssueChangeset {
    title: Option<String>,
    description: Option<String>,
    error_code: Option<Option<String>>,
    keywords: Option<String>,
    updated_at: NaiveDateTime,
}

#[derive(Serialize)]
pub struct IssueResponse {
    pub id: Uuid,
    pub machine_id: Uuid,
    pub title: String,
    pub description: String,
    pub error_code: Option<String>,
    pub keywords: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub images: Vec<FileRef>,
}

impl IssueResponse {
    pub fn new(issue: &Issue, files: &[ManagedFile]) -> Self {
        Self {
            id: issue.id,
            machine_id: issue.machine_id,
            title: issue.title.clone(),
            description: issue.description.clone(),
            error_code: issue.error_code.clone(),
            keywords: issue.keywords.clone(),
            created_by: issue.created_by,
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            images: file_routes::file_refs(files, FileKind::Image),
        }
    }
}

#[derive(Serialize)]
pub struct IssueDetail {
    #[serde(flatten)]
    pub issue: IssueResponse,
    pub solutions: Vec<SolutionResponse>,
}

impl From<&IssueNode> for IssueDetail {
    fn from(node: &IssueNode) -> Self {
        Self {
            issue: IssueResponse::new(&node.issue, &node.files),
            solutions: node.solutions.iter().map(SolutionResponse::from).collect(),
        }
    }
}

fn with_images(conn: &mut PgConnection, rows: &[Issue]) -> QueryResult<Vec<IssueResponse>> {
    let ids: Vec<Uuid> = rows.iter().map(|issue| issue.id).collect();
    let mut by_issue: HashMap<Uuid, Vec<ManagedFile>> = HashMap::new();
    for file in files::list_files_for(conn, EntityKind::Issue, &ids)? {
        by_issue.entry(file.entity_id).or_default().push(file);
    }
    Ok(rows
        .iter()
        .map(|issue| {
            let files = by_issue.remove(&issue.id).unwrap_or_default();
            IssueResponse::new(issue, &files)
        })
        .collect())
}

fn issue_detail(conn: &mut PgConnection, issue_id: Uuid) -> AppResult<IssueDetail> {
    let issue: Issue = issues::table.find(issue_id).first(conn)?;
    let nodes = graph::issue_nodes(conn, vec![issue])?;
    nodes
        .first()
        .map(IssueDetail::from)
        .ok_or_else(AppError::not_found)
}

pub async fn list_issues(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<Json<Vec<IssueResponse>>> {
    let mut conn = state.db()?;
    access::machine(&mut conn, machine_id, &user, Access::View)?;

    let rows: Vec<Issue> = issues::table
        .filter(issues::machine_id.eq(machine_id))
        .order((issues::created_at.asc(), issues::id.asc()))
        .load(&mut conn)?;
    Ok(Json(with_images(&mut conn, &rows)?))
}

pub async fn create_issue(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
    Json(payload): Json<CreateIssueRequest>,
) -> AppResult<(StatusCode, Json<IssueDetail>)> {
    let mut conn = state.db()?;
    access::machine(&mut conn, machine_id, &user, Access::Modify)?;

    let title = payload.title.trim();
    let description = payload.description.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if description.is_empty() {
        return Err(AppError::bad_request("description must not be empty"));
    }

    let new_issue = NewIssue {
        id: Uuid::new_v4(),
        machine_id,
        title: title.to_string(),
        description: description.to_string(),
        error_code: payload
            .error_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string),
        keywords: payload.keywords.trim().to_string(),
        created_by: Some(user.user_id),
        created_at: None,
    };
    diesel::insert_into(issues::table)
        .values(&new_issue)
        .execute(&mut conn)?;

    activity::record(
        &mut conn,
        user.user_id,
        activity::ISSUE_CREATE,
        format!("Reported issue \"{}\"", new_issue.title),
        Subject::issue(machine_id, new_issue.id),
    );

    Ok((StatusCode::CREATED, Json(issue_detail(&mut conn, new_issue.id)?)))
}

pub async fn get_issue(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
) -> AppResult<Json<IssueDetail>> {
    let mut conn = state.db()?;
    let machine = access::issue(&mut conn, issue_id, &user, Access::View)?;
    let detail = issue_detail(&mut conn, issue_id)?;

    activity::record(
        &mut conn,
        user.user_id,
        activity::ISSUE_VIEW,
        format!("Viewed issue \"{}\"", detail.issue.title),
        Subject::issue(machine.id, issue_id),
    );
    Ok(Json(detail))
}

pub async fn update_issue(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<IssueDetail>> {
    let mut conn = state.db()?;
    let machine = access::issue(&mut conn, issue_id, &user, Access::Modify)?;

    let changeset = IssueChangeset {
        title: required_text(&body, "title").map_err(AppError::bad_request)?,
        description: required_text(&body, "description").map_err(AppError::bad_request)?,
        error_code: nullable_text(&body, "error_code").map_err(AppError::bad_request)?,
        keywords: nullable_text(&body, "keywords")
            .map_err(AppError::bad_request)?
            .map(Option::unwrap_or_default),
        updated_at: Utc::now().naive_utc(),
    };

    let touched = changeset.title.is_some()
        || changeset.description.is_some()
        || changeset.error_code.is_some()
        || changeset.keywords.is_some();
    if touched {
        diesel::update(issues::table.find(issue_id))
            .set(&changeset)
            .execute(&mut conn)?;
        activity::record(
            &mut conn,
            user.user_id,
            activity::ISSUE_UPDATE,
            "Updated an issue",
            Subject::issue(machine.id, issue_id),
        );
    }

    Ok(Json(issue_detail(&mut conn, issue_id)?))
}

pub async fn delete_issue(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::issue(&mut conn, issue_id, &user, Access::Modify)?;
    }
    cleanup::delete_entity(&state, DeleteRoot::Issue(issue_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn match_issues(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<MatchRequest>,
) -> AppResult<Json<MatchResponse>> {
    let mut conn = state.db()?;
    access::machine(&mut conn, payload.machine_id, &user, Access::View)?;

    let matched = matching::match_issues(&mut conn, payload.machine_id, &payload.description)?;
    Ok(Json(MatchResponse {
        matching_issues: with_images(&mut conn, &matched)?,
    }))
}

pub async fn list_images(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
) -> AppResult<Json<Vec<FileRef>>> {
    file_routes::list_entity_files(&state, &user, EntityRef::issue(issue_id), FileKind::Image)
        .map(Json)
}

pub async fn upload_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileRef>)> {
    file_routes::upload_entity_file(
        &state,
        &user,
        EntityRef::issue(issue_id),
        FileKind::Image,
        multipart,
    )
    .await
}

pub async fn delete_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((issue_id, file_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    file_routes::delete_entity_file(
        &state,
        &user,
        EntityRef::issue(issue_id),
        FileKind::Image,
        file_id,
    )
    .await
}
