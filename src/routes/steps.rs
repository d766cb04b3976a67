use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::{
    access::{self, Access},
    auth::AuthenticatedUser,
    cleanup::{self, DeleteRoot},
    error::{AppError, AppResult},
    files::{EntityRef, FileKind},
    graph::{self, StepNode},
    models::{NewStep, Step},
    routes::files::{self as file_routes, FileRef},
    schema::steps,
    state::AppState,
};

#[derive(Debug, Clone, Deserialize)]
pub struct StepInput {
    pub step_number: i32,
    pub description: String,
    #[serde(default)]
    pub video_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStepRequest {
    pub step_number: Option<i32>,
    pub description: Option<String>,
    pub video_urls: Option<Vec<String>>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = steps)]
struct StepChangeset {
    step_number: Option<i32>,
    description: Option<String>,
    video_urls: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub id: Uuid,
    pub guide_id: Uuid,
    pub step_number: i32,
    pub description: String,
    pub video_urls: Vec<String>,
    pub images: Vec<FileRef>,
}

impl From<&StepNode> for StepResponse {
    fn from(node: &StepNode) -> Self {
        Self {
            id: node.step.id,
            guide_id: node.step.guide_id,
            step_number: node.step.step_number,
            description: node.step.description.clone(),
            video_urls: node.step.video_urls.clone(),
            images: file_routes::file_refs(&node.files, FileKind::Image),
        }
    }
}

pub fn validate_step_number(step_number: i32) -> AppResult<()> {
    if step_number <= 0 {
        return Err(AppError::bad_request("step_number must be a positive integer"));
    }
    Ok(())
}

pub fn validate_video_urls(urls: &[String]) -> AppResult<Vec<String>> {
    urls.iter()
        .map(|raw| {
            let trimmed = raw.trim();
            match Url::parse(trimmed) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(trimmed.to_string()),
                _ => Err(AppError::bad_request(format!(
                    "invalid video URL '{trimmed}': expected an absolute http(s) URL"
                ))),
            }
        })
        .collect()
}

impl StepInput {
    pub fn into_new_step(self, guide_id: Uuid) -> AppResult<NewStep> {
        validate_step_number(self.step_number)?;
        let description = self.description.trim();
        if description.is_empty() {
            return Err(AppError::bad_request("step description must not be empty"));
        }
        Ok(NewStep {
            id: Uuid::new_v4(),
            guide_id,
            step_number: self.step_number,
            description: description.to_string(),
            video_urls: validate_video_urls(&self.video_urls)?,
        })
    }
}

pub async fn create_step(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(guide_id): Path<Uuid>,
    Json(payload): Json<StepInput>,
) -> AppResult<(StatusCode, Json<StepResponse>)> {
    let mut conn = state.db()?;
    access::guide(&mut conn, guide_id, &user, Access::Modify)?;

    let new_step = payload.into_new_step(guide_id)?;
    diesel::insert_into(steps::table)
        .values(&new_step)
        .execute(&mut conn)?;

    let step: Step = steps::table.find(new_step.id).first(&mut conn)?;
    let node = graph::step_node(&mut conn, step)?;
    Ok((StatusCode::CREATED, Json(StepResponse::from(&node))))
}

pub async fn update_step(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(step_id): Path<Uuid>,
    Json(payload): Json<UpdateStepRequest>,
) -> AppResult<Json<StepResponse>> {
    let mut conn = state.db()?;
    access::step(&mut conn, step_id, &user, Access::Modify)?;

    let mut changeset = StepChangeset::default();
    if let Some(step_number) = payload.step_number {
        validate_step_number(step_number)?;
        changeset.step_number = Some(step_number);
    }
    if let Some(description) = payload.description {
        let trimmed = description.trim();
        if trimmed.is_empty() {
            return Err(AppError::bad_request("step description must not be empty"));
        }
        changeset.description = Some(trimmed.to_string());
    }
    if let Some(urls) = payload.video_urls {
        changeset.video_urls = Some(validate_video_urls(&urls)?);
    }

    let has_changes = changeset.step_number.is_some()
        || changeset.description.is_some()
        || changeset.video_urls.is_some();
    if has_changes {
        diesel::update(steps::table.find(step_id))
            .set(&changeset)
            .execute(&mut conn)?;
    }

    let step: Step = steps::table.find(step_id).first(&mut conn)?;
    let node = graph::step_node(&mut conn, step)?;
    Ok(Json(StepResponse::from(&node)))
}

pub async fn delete_step(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(step_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::step(&mut conn, step_id, &user, Access::Modify)?;
    }
    cleanup::delete_entity(&state, DeleteRoot::Step(step_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_images(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(step_id): Path<Uuid>,
) -> AppResult<Json<Vec<FileRef>>> {
    file_routes::list_entity_files(&state, &user, EntityRef::step(step_id), FileKind::Image)
        .map(Json)
}

pub async fn upload_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(step_id): Path<Uuid>,
    multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileRef>)> {
    file_routes::upload_entity_file(
        &state,
        &user,
        EntityRef::step(step_id),
        FileKind::Image,
        multipart,
    )
    .await
}

pub async fn delete_image(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((step_id, file_id)): Path<(Uuid, Uuid)>,
) -> AppResult<StatusCode> {
    file_routes::delete_entity_file(
        &state,
        &user,
        EntityRef::step(step_id),
        FileKind::Image,
        file_id,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_numbers_must_be_positive() {
        assert!(validate_step_number(1).is_ok());
        assert!(validate_step_number(0).is_err());
        assert!(validate_step_number(-4).is_err());
    }

    #[test]
    fn only_absolute_http_urls_are_accepted() {
        let accepted = validate_video_urls(&[
            " https://videos.example.com/spindle ".to_string(),
            "http://intranet/clip.mp4".to_string(),
        ])
        .unwrap();
        assert_eq!(accepted[0], "https://videos.example.com/spindle");

        assert!(validate_video_urls(&["ftp://files.example.com/a".to_string()]).is_err());
        assert!(validate_video_urls(&["/relative/path".to_string()]).is_err());
    }

    #[test]
    fn step_input_is_trimmed_and_checked() {
        let guide_id = Uuid::new_v4();
        let step = StepInput {
            step_number: 2,
            description: "  Loosen the bolts ".to_string(),
            video_urls: Vec::new(),
        }
        .into_new_step(guide_id)
        .unwrap();
        assert_eq!(step.guide_id, guide_id);
        assert_eq!(step.description, "Loosen the bolts");

        let blank = StepInput {
            step_number: 1,
            description: "   ".to_string(),
            video_urls: Vec::new(),
        };
        assert!(blank.into_new_step(guide_id).is_err());
    }
}
