use std::{fmt, io::Write, str::FromStr};

use axum::http::StatusCode;
use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    prelude::*,
    result::DatabaseErrorKind,
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Text,
    PgConnection,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{ManagedFile, NewManagedFile},
    schema::managed_files,
    state::AppState,
    storage::ObjectStorage,
};

const DUPLICATE_CONCURRENCY: usize = 4;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Machine,
    Issue,
    Step,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Machine => "machine",
            EntityKind::Issue => "issue",
            EntityKind::Step => "step",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, AsExpression, FromSqlRow, Serialize, Deserialize,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Manual,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Manual => "manual",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "machine" => Ok(EntityKind::Machine),
            "issue" => Ok(EntityKind::Issue),
            "step" => Ok(EntityKind::Step),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

impl FromStr for FileKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "image" => Ok(FileKind::Image),
            "manual" => Ok(FileKind::Manual),
            other => Err(format!("unknown file kind '{other}'")),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql<Text, Pg> for EntityKind {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for EntityKind {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        raw.parse().map_err(Into::into)
    }
}

impl ToSql<Text, Pg> for FileKind {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for FileKind {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        raw.parse().map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub fn machine(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Machine,
            id,
        }
    }

    pub fn issue(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Issue,
            id,
        }
    }

    pub fn step(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Step,
            id,
        }
    }

    pub fn accepts(&self, file_kind: FileKind) -> bool {
        match file_kind {
            FileKind::Image => true,
            FileKind::Manual => self.kind == EntityKind::Machine,
        }
    }
}

impl ManagedFile {
    pub fn entity(&self) -> EntityRef {
        EntityRef {
            kind: self.entity_kind,
            id: self.entity_id,
        }
    }
}

pub fn object_key(entity: EntityRef, file_id: Uuid) -> String {
    format!("files/{}/{}/{}", entity.kind, entity.id, file_id)
}

#[derive(Debug)]
pub struct FileUpload {
    pub original_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    pub fn resolved_content_type(&self) -> Option<String> {
        self.content_type
            .clone()
            .filter(|value| !value.is_empty() && value != "application/octet-stream")
            .or_else(|| {
                mime_guess::from_path(&self.original_name)
                    .first()
                    .map(|mime| mime.essence_str().to_string())
            })
            .or_else(|| self.content_type.clone())
    }
}

#[derive(Debug, Clone)]
pub struct FileDuplicate {
    pub source_key: String,
    pub record: NewManagedFile,
}

pub fn plan_duplicate(file: &ManagedFile, target: EntityRef) -> FileDuplicate {
    let id = Uuid::new_v4();
    FileDuplicate {
        source_key: file.s3_key.clone(),
        record: NewManagedFile {
            id,
            entity_kind: target.kind,
            entity_id: target.id,
            file_kind: file.file_kind,
            s3_key: object_key(target, id),
            original_name: file.original_name.clone(),
            content_type: file.content_type.clone(),
            size_bytes: file.size_bytes,
            checksum: file.checksum.clone(),
            uploaded_at: None,
        },
    }
}

pub async fn duplicate_objects(
    storage: &dyn ObjectStorage,
    duplicates: &[FileDuplicate],
) -> anyhow::Result<()> {
    let outcomes: Vec<(&str, anyhow::Result<()>)> = stream::iter(duplicates)
        .map(|duplicate| async move {
            let result = storage
                .copy_object(&duplicate.source_key, &duplicate.record.s3_key)
                .await;
            (duplicate.record.s3_key.as_str(), result)
        })
        .buffer_unordered(DUPLICATE_CONCURRENCY)
        .boxed()
        .collect()
        .await;

    let mut copied = Vec::new();
    let mut first_error = None;
    for (key, result) in outcomes {
        match result {
            Ok(()) => copied.push(key.to_string()),
            Err(err) if first_error.is_none() => first_error = Some(err),
            Err(err) => warn!(key = %key, error = %err, "additional file duplication failure"),
        }
    }

    match first_error {
        None => Ok(()),
        Some(err) => {
            remove_objects(storage, &copied).await;
            Err(err)
        }
    }
}

pub async fn remove_objects(storage: &dyn ObjectStorage, keys: &[String]) -> Vec<String> {
    let mut failures = Vec::new();
    for key in keys {
        if let Err(err) = storage.delete_object(key).await {
            warn!(key = %key, error = %err, "failed to delete stored object");
            failures.push(format!("{key}: {err}"));
        }
    }
    failures
}

pub fn list_files(conn: &mut PgConnection, entity: EntityRef) -> QueryResult<Vec<ManagedFile>> {
    managed_files::table
        .filter(managed_files::entity_kind.eq(entity.kind))
        .filter(managed_files::entity_id.eq(entity.id))
        .order((managed_files::uploaded_at.asc(), managed_files::id.asc()))
        .load(conn)
}

pub fn list_files_for(
    conn: &mut PgConnection,
    kind: EntityKind,
    ids: &[Uuid],
) -> QueryResult<Vec<ManagedFile>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    managed_files::table
        .filter(managed_files::entity_kind.eq(kind))
        .filter(managed_files::entity_id.eq_any(ids))
        .order((managed_files::uploaded_at.asc(), managed_files::id.asc()))
        .load(conn)
}

pub async fn attach_file(
    state: &AppState,
    entity: EntityRef,
    file_kind: FileKind,
    upload: FileUpload,
) -> AppResult<ManagedFile> {
    if !entity.accepts(file_kind) {
        return Err(AppError::bad_request(format!(
            "{file_kind} files cannot be attached to a {}",
            entity.kind
        )));
    }
    if upload.bytes.is_empty() {
        return Err(AppError::bad_request("file must not be empty"));
    }

    let id = Uuid::new_v4();
    let s3_key = object_key(entity, id);
    let content_type = upload.resolved_content_type();
    let record = NewManagedFile {
        id,
        entity_kind: entity.kind,
        entity_id: entity.id,
        file_kind,
        s3_key: s3_key.clone(),
        original_name: upload.original_name.clone(),
        content_type: content_type.clone(),
        size_bytes: upload.bytes.len() as i64,
        checksum: hex::encode(Sha256::digest(&upload.bytes)),
        uploaded_at: None,
    };

    state
        .storage
        .put_object(
            &s3_key,
            upload.bytes,
            content_type,
            inline_content_disposition(&upload.original_name),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to store file: {err}")))?;

    let inserted = {
        let mut conn = state.db()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            // A machine holds a single manual; the new upload replaces it.
            let replaced: Vec<String> = if file_kind == FileKind::Manual {
                diesel::delete(
                    managed_files::table
                        .filter(managed_files::entity_kind.eq(entity.kind))
                        .filter(managed_files::entity_id.eq(entity.id))
                        .filter(managed_files::file_kind.eq(FileKind::Manual)),
                )
                .returning(managed_files::s3_key)
                .get_results(conn)?
            } else {
                Vec::new()
            };

            diesel::insert_into(managed_files::table)
                .values(&record)
                .execute(conn)?;
            let file: ManagedFile = managed_files::table.find(id).first(conn)?;
            Ok((file, replaced))
        })
    };

    match inserted {
        Ok((file, replaced)) => {
            remove_objects(state.storage.as_ref(), &replaced).await;
            info!(
                file_id = %file.id,
                entity_kind = %entity.kind,
                entity_id = %entity.id,
                file_kind = %file_kind,
                size_bytes = file.size_bytes,
                "file attached"
            );
            Ok(file)
        }
        Err(err) => {
            remove_objects(state.storage.as_ref(), &[s3_key]).await;
            match err {
                diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => Err(
                    AppError::bad_request("a manual was uploaded concurrently, retry the upload"),
                ),
                other => Err(AppError::from(other)),
            }
        }
    }
}

// Row first; a failed object delete leaves an unreferenced blob behind.
pub async fn detach_file(
    state: &AppState,
    entity: EntityRef,
    file_kind: FileKind,
    file_id: Uuid,
) -> AppResult<()> {
    let removed: Option<String> = {
        let mut conn = state.db()?;
        diesel::delete(
            managed_files::table
                .filter(managed_files::id.eq(file_id))
                .filter(managed_files::entity_kind.eq(entity.kind))
                .filter(managed_files::entity_id.eq(entity.id))
                .filter(managed_files::file_kind.eq(file_kind)),
        )
        .returning(managed_files::s3_key)
        .get_result(&mut conn)
        .optional()?
    };

    let key = removed.ok_or_else(AppError::not_found)?;
    remove_objects(state.storage.as_ref(), &[key]).await;
    Ok(())
}

pub async fn detach_manual(state: &AppState, machine_id: Uuid) -> AppResult<()> {
    let manual = {
        let mut conn = state.db()?;
        managed_files::table
            .filter(managed_files::entity_kind.eq(EntityKind::Machine))
            .filter(managed_files::entity_id.eq(machine_id))
            .filter(managed_files::file_kind.eq(FileKind::Manual))
            .first::<ManagedFile>(&mut conn)
            .optional()?
    };
    let manual = manual.ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "no manual found"))?;
    detach_file(state, EntityRef::machine(machine_id), FileKind::Manual, manual.id).await
}

pub fn inline_content_disposition(filename: &str) -> Option<String> {
    if filename.is_empty() {
        return None;
    }

    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    Some(format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        sanitized, encoded
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_file(kind: FileKind) -> ManagedFile {
        let id = Uuid::new_v4();
        let entity = EntityRef::machine(Uuid::new_v4());
        ManagedFile {
            id,
            entity_kind: entity.kind,
            entity_id: entity.id,
            file_kind: kind,
            s3_key: object_key(entity, id),
            original_name: "vf2-manual.pdf".to_string(),
            content_type: Some("application/pdf".to_string()),
            size_bytes: 42,
            checksum: "ab".repeat(32),
            uploaded_at: Utc::now().naive_utc(),
        }
    }

    #[test]
    fn kinds_round_trip_through_their_names() {
        for kind in [EntityKind::Machine, EntityKind::Issue, EntityKind::Step] {
            assert_eq!(kind.as_str().parse::<EntityKind>(), Ok(kind));
        }
        for kind in [FileKind::Image, FileKind::Manual] {
            assert_eq!(kind.as_str().parse::<FileKind>(), Ok(kind));
        }
        assert!("Machine".parse::<EntityKind>().is_err());
        assert!("video".parse::<FileKind>().is_err());
    }

    #[test]
    fn manuals_only_attach_to_machines() {
        let id = Uuid::new_v4();
        assert!(EntityRef::machine(id).accepts(FileKind::Manual));
        assert!(!EntityRef::issue(id).accepts(FileKind::Manual));
        assert!(!EntityRef::step(id).accepts(FileKind::Manual));
        assert!(EntityRef::step(id).accepts(FileKind::Image));
    }

    #[test]
    fn object_keys_are_scoped_by_entity() {
        let entity = EntityRef::step(Uuid::nil());
        let file_id = Uuid::nil();
        assert_eq!(
            object_key(entity, file_id),
            format!("files/step/{}/{}", Uuid::nil(), Uuid::nil())
        );
    }

    #[test]
    fn planned_duplicate_gets_fresh_identity() {
        let original = sample_file(FileKind::Manual);
        let target = EntityRef::machine(Uuid::new_v4());
        let duplicate = plan_duplicate(&original, target);

        assert_eq!(duplicate.source_key, original.s3_key);
        assert_ne!(duplicate.record.id, original.id);
        assert_ne!(duplicate.record.s3_key, original.s3_key);
        assert_eq!(duplicate.record.entity_id, target.id);
        assert_eq!(duplicate.record.file_kind, FileKind::Manual);
        assert_eq!(duplicate.record.checksum, original.checksum);
        assert_eq!(duplicate.record.s3_key, object_key(target, duplicate.record.id));
    }

    #[test]
    fn content_type_falls_back_to_extension() {
        let upload = FileUpload {
            original_name: "spindle.png".to_string(),
            content_type: Some("application/octet-stream".to_string()),
            bytes: vec![1],
        };
        assert_eq!(upload.resolved_content_type().as_deref(), Some("image/png"));

        let declared = FileUpload {
            original_name: "notes".to_string(),
            content_type: Some("text/plain".to_string()),
            bytes: vec![1],
        };
        assert_eq!(declared.resolved_content_type().as_deref(), Some("text/plain"));
    }

    #[test]
    fn content_disposition_is_sanitized() {
        let header = inline_content_disposition("my \"manual\".pdf").expect("header");
        assert!(header.starts_with("inline; filename=\"my _manual_.pdf\""));
        assert!(inline_content_disposition("").is_none());
    }
}
