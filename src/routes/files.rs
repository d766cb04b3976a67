use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::Redirect,
    Json,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::{
    access::{self, Access},
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    files::{self, EntityRef, FileKind, FileUpload},
    models::ManagedFile,
    schema::managed_files,
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct FileRef {
    pub id: Uuid,
    pub kind: FileKind,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: i64,
    pub checksum: String,
    pub url: String,
    pub uploaded_at: NaiveDateTime,
}

impl From<&ManagedFile> for FileRef {
    fn from(file: &ManagedFile) -> Self {
        Self {
            id: file.id,
            kind: file.file_kind,
            original_name: file.original_name.clone(),
            content_type: file.content_type.clone(),
            size_bytes: file.size_bytes,
            checksum: file.checksum.clone(),
            url: format!("/api/files/{}", file.id),
            uploaded_at: file.uploaded_at,
        }
    }
}

pub fn file_refs(files: &[ManagedFile], kind: FileKind) -> Vec<FileRef> {
    files
        .iter()
        .filter(|file| file.file_kind == kind)
        .map(FileRef::from)
        .collect()
}

pub async fn read_upload(
    multipart: &mut Multipart,
    field_name: &str,
    max_bytes: usize,
) -> AppResult<FileUpload> {
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        if field.name() != Some(field_name) {
            continue;
        }
        let original_name = field
            .file_name()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::bad_request("filename is required"))?;
        let content_type = field.content_type().map(|mime| mime.to_string());
        let data = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read file bytes");
            AppError::bad_request(format!("failed to read file bytes: {err}"))
        })?;
        if data.len() > max_bytes {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("file exceeds the {max_bytes} byte limit"),
            ));
        }
        return Ok(FileUpload {
            original_name,
            content_type,
            bytes: data.to_vec(),
        });
    }

    Err(AppError::bad_request(format!("{field_name} field is required")))
}

fn validate_upload(kind: FileKind, upload: &FileUpload) -> AppResult<()> {
    match kind {
        FileKind::Image => {
            let is_image = upload
                .resolved_content_type()
                .is_some_and(|mime| mime.starts_with("image/"));
            if !is_image {
                return Err(AppError::bad_request("only image files are accepted"));
            }
        }
        FileKind::Manual => {
            if !upload.original_name.to_lowercase().ends_with(".pdf") {
                return Err(AppError::bad_request("manual must be a PDF file"));
            }
        }
    }
    Ok(())
}

pub fn list_entity_files(
    state: &AppState,
    user: &AuthenticatedUser,
    entity: EntityRef,
    kind: FileKind,
) -> AppResult<Vec<FileRef>> {
    let mut conn = state.db()?;
    access::entity(&mut conn, entity, user, Access::View)?;
    let files = files::list_files(&mut conn, entity)?;
    Ok(file_refs(&files, kind))
}

pub async fn upload_entity_file(
    state: &AppState,
    user: &AuthenticatedUser,
    entity: EntityRef,
    kind: FileKind,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<FileRef>)> {
    {
        let mut conn = state.db()?;
        access::entity(&mut conn, entity, user, Access::Modify)?;
    }

    let upload = read_upload(&mut multipart, kind.as_str(), state.config.max_upload_bytes).await?;
    validate_upload(kind, &upload)?;
    let file = files::attach_file(state, entity, kind, upload).await?;
    Ok((StatusCode::CREATED, Json(FileRef::from(&file))))
}

pub async fn delete_entity_file(
    state: &AppState,
    user: &AuthenticatedUser,
    entity: EntityRef,
    kind: FileKind,
    file_id: Uuid,
) -> AppResult<StatusCode> {
    {
        let mut conn = state.db()?;
        access::entity(&mut conn, entity, user, Access::Modify)?;
    }
    files::detach_file(state, entity, kind, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_file(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(file_id): Path<Uuid>,
) -> AppResult<Redirect> {
    let file: ManagedFile = {
        let mut conn = state.db()?;
        let file: ManagedFile = managed_files::table.find(file_id).first(&mut conn)?;
        access::entity(&mut conn, file.entity(), &user, Access::View)?;
        file
    };

    let presigned_url = state
        .storage
        .presign_get_object(&file.s3_key, state.file_url_expiry())
        .await
        .map_err(|err| AppError::internal(format!("failed to generate file URL: {err}")))?;

    Ok(Redirect::temporary(&presigned_url))
}
