use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{prelude::*, result::DatabaseErrorKind, PgConnection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    access::{self, Access},
    activity::{self, Subject},
    auth::AuthenticatedUser,
    cleanup::{self, DeleteRoot},
    error::{AppError, AppResult},
    graph::{self, GuideNode, SolutionNode},
    models::{Guide, NewGuide, NewSolution, NewStep, Solution},
    routes::steps::{StepInput, StepResponse},
    schema::{guides, solutions, steps},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct GuideInput {
    pub title: String,
    #[serde(default)]
    pub steps: Vec<StepInput>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSolutionRequest {
    pub description: String,
    pub guide: Option<GuideInput>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSolutionRequest {
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateGuideRequest {
    pub title: Option<String>,
    pub steps: Option<Vec<StepInput>>,
}

#[derive(Serialize)]
pub struct GuideResponse {
    pub id: Uuid,
    pub solution_id: Uuid,
    pub title: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub steps: Vec<StepResponse>,
}

impl From<&GuideNode> for GuideResponse {
    fn from(node: &GuideNode) -> Self {
        Self {
            id: node.guide.id,
            solution_id: node.guide.solution_id,
            title: node.guide.title.clone(),
            created_by: node.guide.created_by,
            created_at: node.guide.created_at,
            updated_at: node.guide.updated_at,
            steps: node.steps.iter().map(StepResponse::from).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct SolutionResponse {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub description: String,
    pub created_by: Option<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub guide: Option<GuideResponse>,
}

impl From<&SolutionNode> for SolutionResponse {
    fn from(node: &SolutionNode) -> Self {
        Self {
            id: node.solution.id,
            issue_id: node.solution.issue_id,
            description: node.solution.description.clone(),
            created_by: node.solution.created_by,
            created_at: node.solution.created_at,
            updated_at: node.solution.updated_at,
            guide: node.guide.as_ref().map(GuideResponse::from),
        }
    }
}

struct PlannedGuide {
    guide: NewGuide,
    steps: Vec<NewStep>,
}

fn plan_guide(input: GuideInput, solution_id: Uuid, user_id: Uuid) -> AppResult<PlannedGuide> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("guide title must not be empty"));
    }
    let guide = NewGuide {
        id: Uuid::new_v4(),
        solution_id,
        title: title.to_string(),
        created_by: Some(user_id),
    };
    let steps = input
        .steps
        .into_iter()
        .map(|step| step.into_new_step(guide.id))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(PlannedGuide { guide, steps })
}

fn insert_guide(conn: &mut PgConnection, planned: &PlannedGuide) -> QueryResult<()> {
    diesel::insert_into(guides::table)
        .values(&planned.guide)
        .execute(conn)?;
    if !planned.steps.is_empty() {
        diesel::insert_into(steps::table)
            .values(&planned.steps)
            .execute(conn)?;
    }
    Ok(())
}

fn solution_response(conn: &mut PgConnection, solution_id: Uuid) -> AppResult<SolutionResponse> {
    let solution: Solution = solutions::table.find(solution_id).first(conn)?;
    let nodes = graph::solution_nodes(conn, vec![solution])?;
    nodes
        .first()
        .map(SolutionResponse::from)
        .ok_or_else(AppError::not_found)
}

fn guide_response(conn: &mut PgConnection, guide_id: Uuid) -> AppResult<GuideResponse> {
    let guide: Guide = guides::table.find(guide_id).first(conn)?;
    let nodes = graph::guide_nodes(conn, vec![guide])?;
    nodes
        .first()
        .map(GuideResponse::from)
        .ok_or_else(AppError::not_found)
}

fn guide_conflict(err: diesel::result::Error) -> AppError {
    match err {
        diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            AppError::bad_request("solution already has a guide")
        }
        other => AppError::from(other),
    }
}

pub async fn list_solutions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
) -> AppResult<Json<Vec<SolutionResponse>>> {
    let mut conn = state.db()?;
    access::issue(&mut conn, issue_id, &user, Access::View)?;

    let rows: Vec<Solution> = solutions::table
        .filter(solutions::issue_id.eq(issue_id))
        .order((solutions::created_at.asc(), solutions::id.asc()))
        .load(&mut conn)?;
    let nodes = graph::solution_nodes(&mut conn, rows)?;
    Ok(Json(nodes.iter().map(SolutionResponse::from).collect()))
}

pub async fn create_solution(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issue_id): Path<Uuid>,
    Json(payload): Json<CreateSolutionRequest>,
) -> AppResult<(StatusCode, Json<SolutionResponse>)> {
    let mut conn = state.db()?;
    let machine = access::issue(&mut conn, issue_id, &user, Access::Modify)?;

    let description = payload.description.trim();
    if description.is_empty() {
        return Err(AppError::bad_request("description must not be empty"));
    }
    let new_solution = NewSolution {
        id: Uuid::new_v4(),
        issue_id,
        description: description.to_string(),
        created_by: Some(user.user_id),
        created_at: None,
    };
    let planned_guide = payload
        .guide
        .map(|guide| plan_guide(guide, new_solution.id, user.user_id))
        .transpose()?;

    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        diesel::insert_into(solutions::table)
            .values(&new_solution)
            .execute(conn)?;
        if let Some(planned) = &planned_guide {
            insert_guide(conn, planned)?;
        }
        Ok(())
    })?;

    let subject = Subject::issue(machine.id, issue_id);
    activity::record(
        &mut conn,
        user.user_id,
        activity::SOLUTION_CREATE,
        "Added a solution",
        subject,
    );
    if let Some(planned) = &planned_guide {
        activity::record(
            &mut conn,
            user.user_id,
            activity::GUIDE_CREATE,
            format!("Created guide \"{}\"", planned.guide.title),
            subject,
        );
    }

    let response = solution_response(&mut conn, new_solution.id)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn update_solution(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(solution_id): Path<Uuid>,
    Json(payload): Json<UpdateSolutionRequest>,
) -> AppResult<Json<SolutionResponse>> {
    let mut conn = state.db()?;
    let machine = access::solution(&mut conn, solution_id, &user, Access::Modify)?;

    if let Some(description) = payload.description {
        let trimmed = description.trim();
        if trimmed.is_empty() {
            return Err(AppError::bad_request("description must not be empty"));
        }
        let solution: Solution = diesel::update(solutions::table.find(solution_id))
            .set((
                solutions::description.eq(trimmed),
                solutions::updated_at.eq(Utc::now().naive_utc()),
            ))
            .get_result(&mut conn)?;
        activity::record(
            &mut conn,
            user.user_id,
            activity::SOLUTION_UPDATE,
            "Updated a solution",
            Subject::issue(machine.id, solution.issue_id),
        );
    }

    Ok(Json(solution_response(&mut conn, solution_id)?))
}

pub async fn delete_solution(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(solution_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::solution(&mut conn, solution_id, &user, Access::Modify)?;
    }
    cleanup::delete_entity(&state, DeleteRoot::Solution(solution_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_guide(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(solution_id): Path<Uuid>,
    Json(payload): Json<GuideInput>,
) -> AppResult<(StatusCode, Json<GuideResponse>)> {
    let mut conn = state.db()?;
    let machine = access::solution(&mut conn, solution_id, &user, Access::Modify)?;

    let existing: Option<Uuid> = guides::table
        .filter(guides::solution_id.eq(solution_id))
        .select(guides::id)
        .first(&mut conn)
        .optional()?;
    if existing.is_some() {
        return Err(AppError::bad_request("solution already has a guide"));
    }

    let planned = plan_guide(payload, solution_id, user.user_id)?;
    conn.transaction(|conn| insert_guide(conn, &planned))
        .map_err(guide_conflict)?;

    let issue_id: Uuid = solutions::table
        .find(solution_id)
        .select(solutions::issue_id)
        .first(&mut conn)?;
    activity::record(
        &mut conn,
        user.user_id,
        activity::GUIDE_CREATE,
        format!("Created guide \"{}\"", planned.guide.title),
        Subject::issue(machine.id, issue_id),
    );

    let response = guide_response(&mut conn, planned.guide.id)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn update_guide(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(guide_id): Path<Uuid>,
    Json(payload): Json<UpdateGuideRequest>,
) -> AppResult<Json<GuideResponse>> {
    let mut conn = state.db()?;
    let machine = access::guide(&mut conn, guide_id, &user, Access::Modify)?;

    let title = payload
        .title
        .map(|title| {
            let trimmed = title.trim().to_string();
            if trimmed.is_empty() {
                Err(AppError::bad_request("guide title must not be empty"))
            } else {
                Ok(trimmed)
            }
        })
        .transpose()?;
    let replacement = payload
        .steps
        .map(|inputs| {
            inputs
                .into_iter()
                .map(|step| step.into_new_step(guide_id))
                .collect::<AppResult<Vec<_>>>()
        })
        .transpose()?;

    if title.is_none() && replacement.is_none() {
        return Ok(Json(guide_response(&mut conn, guide_id)?));
    }

    let now = Utc::now().naive_utc();
    // Replacing the step list drops the old steps together with their images.
    let released_keys = conn.transaction::<_, diesel::result::Error, _>(|conn| {
        if let Some(title) = &title {
            diesel::update(guides::table.find(guide_id))
                .set((guides::title.eq(title), guides::updated_at.eq(now)))
                .execute(conn)?;
        }

        let mut keys = Vec::new();
        if let Some(new_steps) = &replacement {
            let old_steps: Vec<Uuid> = steps::table
                .filter(steps::guide_id.eq(guide_id))
                .select(steps::id)
                .load(conn)?;
            for step_id in old_steps {
                keys.extend(cleanup::delete_rows(conn, DeleteRoot::Step(step_id))?);
            }
            if !new_steps.is_empty() {
                diesel::insert_into(steps::table)
                    .values(new_steps)
                    .execute(conn)?;
            }
            diesel::update(guides::table.find(guide_id))
                .set(guides::updated_at.eq(now))
                .execute(conn)?;
        }
        Ok(keys)
    })?;
    drop(conn);

    cleanup::remove_stored(&state, &released_keys).await;

    let mut conn = state.db()?;
    let response = guide_response(&mut conn, guide_id)?;
    activity::record(
        &mut conn,
        user.user_id,
        activity::GUIDE_UPDATE,
        format!("Updated guide \"{}\"", response.title),
        Subject::machine(machine.id),
    );
    Ok(Json(response))
}

pub async fn delete_guide(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(guide_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::guide(&mut conn, guide_id, &user, Access::Modify)?;
    }
    cleanup::delete_entity(&state, DeleteRoot::Guide(guide_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
