use std::collections::HashMap;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{dsl::not, prelude::*, PgConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{
    access::{self, Access},
    activity::{self, Subject},
    auth::AuthenticatedUser,
    cleanup::{self, DeleteRoot},
    copy,
    error::{AppError, AppResult},
    files::{self, EntityRef, FileKind},
    graph::MachineGraph,
    models::{Machine, NewHiddenTemplate, NewMachine},
    routes::{
        files::{self as file_routes, FileRef},
        issues::IssueDetail,
    },
    schema::{hidden_templates, machine_copies, machines},
    state::AppState,
    utils::json::{nullable_text, optional_bool, required_text},
};

#[derive(Debug, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub model: String,
    pub series: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub manufacturer: Option<String>,
    pub department: Option<String>,
    pub machine_type: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_template: bool,
}

#[derive(AsChangeset)]
#[diesel(table_name = machines)]
struct MachineChangeset {
    name: Option<String>,
    model: Option<String>,
    series: Option<Option<String>>,
    description: Option<Option<String>>,
    category: Option<Option<String>>,
    manufacturer: Option<Option<String>>,
    department: Option<Option<String>>,
    machine_type: Option<Option<String>>,
    is_public: Option<bool>,
    is_template: Option<bool>,
    updated_at: NaiveDateTime,
}

impl MachineChangeset {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.model.is_none()
            && self.series.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.manufacturer.is_none()
            && self.department.is_none()
            && self.machine_type.is_none()
            && self.is_public.is_none()
            && self.is_template.is_none()
    }
}

#[derive(Serialize)]
pub struct MachineSummary {
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
    pub is_copy: bool,
    pub original_template_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl MachineSummary {
    fn new(machine: &Machine, copied_from: Option<Option<Uuid>>) -> Self {
        Self {
            id: machine.id,
            name: machine.name.clone(),
            model: machine.model.clone(),
            series: machine.series.clone(),
            description: machine.description.clone(),
            category: machine.category.clone(),
            manufacturer: machine.manufacturer.clone(),
            department: machine.department.clone(),
            machine_type: machine.machine_type.clone(),
            owner_id: machine.owner_id,
            is_public: machine.is_public,
            is_template: machine.is_template,
            is_copy: copied_from.is_some(),
            original_template_id: copied_from.flatten(),
            created_at: machine.created_at,
            updated_at: machine.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct MachineDetail {
    #[serde(flatten)]
    pub machine: MachineSummary,
    pub images: Vec<FileRef>,
    pub manual: Option<FileRef>,
    pub issues: Vec<IssueDetail>,
}

#[derive(Serialize)]
pub struct CopyTemplateResponse {
    pub machine_id: Uuid,
}

fn copy_origins(
    conn: &mut PgConnection,
    machine_ids: &[Uuid],
) -> QueryResult<HashMap<Uuid, Option<Uuid>>> {
    if machine_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, Option<Uuid>)> = machine_copies::table
        .filter(machine_copies::machine_id.eq_any(machine_ids))
        .select((
            machine_copies::machine_id,
            machine_copies::original_template_id,
        ))
        .load(conn)?;
    Ok(rows.into_iter().collect())
}

fn summary(conn: &mut PgConnection, machine: &Machine) -> QueryResult<MachineSummary> {
    let origins = copy_origins(conn, &[machine.id])?;
    Ok(MachineSummary::new(machine, origins.get(&machine.id).copied()))
}

fn optional_field(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

pub async fn list_machines(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<MachineSummary>>> {
    let mut conn = state.db()?;

    let hidden = hidden_templates::table
        .filter(hidden_templates::user_id.eq(user.user_id))
        .select(hidden_templates::machine_id);

    let rows: Vec<Machine> = machines::table
        .filter(
            machines::owner_id.eq(user.user_id).or(machines::is_template
                .eq(true)
                .and(not(machines::id.eq_any(hidden)))),
        )
        .order((machines::created_at.desc(), machines::id.desc()))
        .load(&mut conn)?;

    let ids: Vec<Uuid> = rows.iter().map(|machine| machine.id).collect();
    let origins = copy_origins(&mut conn, &ids)?;

    Ok(Json(
        rows.iter()
            .map(|machine| MachineSummary::new(machine, origins.get(&machine.id).copied()))
            .collect(),
    ))
}

pub async fn create_machine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateMachineRequest>,
) -> AppResult<(StatusCode, Json<MachineSummary>)> {
    let name = payload.name.trim();
    let model = payload.model.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    if model.is_empty() {
        return Err(AppError::bad_request("model must not be empty"));
    }
    if payload.is_template && !user.is_admin() {
        return Err(AppError::forbidden());
    }

    let new_machine = NewMachine {
        id: Uuid::new_v4(),
        name: name.to_string(),
        model: model.to_string(),
        series: optional_field(payload.series),
        description: optional_field(payload.description),
        category: optional_field(payload.category),
        manufacturer: optional_field(payload.manufacturer),
        department: optional_field(payload.department),
        machine_type: optional_field(payload.machine_type),
        owner_id: user.user_id,
        is_public: payload.is_public,
        is_template: payload.is_template,
    };

    let mut conn = state.db()?;
    let machine: Machine = diesel::insert_into(machines::table)
        .values(&new_machine)
        .get_result(&mut conn)?;

    info!(
        machine_id = %machine.id,
        owner_id = %user.user_id,
        is_template = machine.is_template,
        "machine created"
    );
    activity::record(
        &mut conn,
        user.user_id,
        activity::MACHINE_CREATE,
        format!("Added machine \"{}\"", machine.name),
        Subject::machine(machine.id),
    );

    Ok((
        StatusCode::CREATED,
        Json(MachineSummary::new(&machine, None)),
    ))
}

pub async fn get_machine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<Json<MachineDetail>> {
    let mut conn = state.db()?;
    let machine = access::machine(&mut conn, machine_id, &user, Access::View)?;
    let summary = summary(&mut conn, &machine)?;
    let graph = MachineGraph::load(&mut conn, machine)?;

    activity::record(
        &mut conn,
        user.user_id,
        activity::MACHINE_VIEW,
        format!("Viewed machine \"{}\"", graph.machine.name),
        Subject::machine(machine_id),
    );

    Ok(Json(MachineDetail {
        machine: summary,
        images: file_routes::file_refs(&graph.files, FileKind::Image),
        manual: file_routes::file_refs(&graph.files, FileKind::Manual)
            .into_iter()
            .next(),
        issues: graph.issues.iter().map(IssueDetail::from).collect(),
    }))
}

pub async fn update_machine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
    Json(body): Json<Value>,
) -> AppResult<Json<MachineSummary>> {
    let mut conn = state.db()?;
    let existing = access::machine(&mut conn, machine_id, &user, Access::Modify)?;

    let text = |field: &str| nullable_text(&body, field).map_err(AppError::bad_request);
    let changeset = MachineChangeset {
        name: required_text(&body, "name").map_err(AppError::bad_request)?,
        model: required_text(&body, "model").map_err(AppError::bad_request)?,
        series: text("series")?,
        description: text("description")?,
        category: text("category")?,
        manufacturer: text("manufacturer")?,
        department: text("department")?,
        machine_type: text("machine_type")?,
        is_public: optional_bool(&body, "is_public").map_err(AppError::bad_request)?,
        is_template: optional_bool(&body, "is_template").map_err(AppError::bad_request)?,
        updated_at: Utc::now().naive_utc(),
    };

    if changeset
        .is_template
        .is_some_and(|flag| flag != existing.is_template)
        && !user.is_admin()
    {
        return Err(AppError::forbidden());
    }

    if changeset.is_empty() {
        return Ok(Json(summary(&mut conn, &existing)?));
    }

    let updated: Machine = diesel::update(machines::table.find(machine_id))
        .set(&changeset)
        .get_result(&mut conn)?;

    activity::record(
        &mut conn,
        user.user_id,
        activity::MACHINE_UPDATE,
        format!("Updated machine \"{}\"", updated.name),
        Subject::machine(machine_id),
    );

    Ok(Json(summary(&mut conn, &updated)?))
}

pub async fn delete_machine(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<Response> {
    let machine = {
        let mut conn = state.db()?;
        let machine = access::machine(&mut conn, machine_id, &user, Access::View)?;

        if machine.is_template {
            diesel::insert_into(hidden_templates::table)
                .values(&NewHiddenTemplate {
                    user_id: user.user_id,
                    machine_id,
                })
                .on_conflict_do_nothing()
                .execute(&mut conn)?;
            info!(machine_id = %machine_id, user_id = %user.user_id, "template hidden");
            return Ok((
                StatusCode::OK,
                Json(json!({ "status": "hidden", "machine_id": machine_id })),
            )
                .into_response());
        }
        machine
    };

    access::authorize(&machine, &user, Access::Modify)?;
    cleanup::delete_entity(&state, DeleteRoot::Machine(machine_id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn copy_template(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(template_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<CopyTemplateResponse>)> {
    let outcome = copy::copy_template(&state, template_id, user.user_id).await?;

    let mut conn = state.db()?;
    activity::record(
        &mut conn,
        user.user_id,
        activity::MACHINE_COPY,
        format!(
            "Copied template with {} issues and {} steps",
            outcome.counts.issues, outcome.counts.steps
        ),
        Subject::machine(outcome.machine_id),
    );

    Ok((
        StatusCode::CREATED,
        Json(CopyTemplateResponse {
            machine_id: outcome.machine_id,
        }),
    ))
}

pub async fn list_images(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<Json<Vec<FileRef>>> {
    file_routes::list_entity_files(
        &state,
        &user,
        EntityRef::machine(machine_id),
        FileKind::Image,
    )
    .map(Json)
}

pub async fn upload_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileRef>)> {
    file_routes::upload_entity_file(
        &state,
        &user,
        EntityRef::machine(machine_id),
        FileKind::Image,
        multipart,
    )
    .await
}

pub async fn delete_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((machine_id, file_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    file_routes::delete_entity_file(
        &state,
        &user,
        EntityRef::machine(machine_id),
        FileKind::Image,
        file_id,
    )
    .await
}

pub async fn get_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<Json<FileRef>> {
    file_routes::list_entity_files(
        &state,
        &user,
        EntityRef::machine(machine_id),
        FileKind::Manual,
    )?
    .into_iter()
    .next()
    .map(Json)
    .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "no manual found"))
}

pub async fn upload_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileRef>)> {
    file_routes::upload_entity_file(
        &state,
        &user,
        EntityRef::machine(machine_id),
        FileKind::Manual,
        multipart,
    )
    .await
}

pub async fn delete_manual(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(machine_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::machine(&mut conn, machine_id, &user, Access::Modify)?;
    }
    files::detach_manual(&state, machine_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
