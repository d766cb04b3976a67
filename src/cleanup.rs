use diesel::{dsl::not, prelude::*, result::Error as DieselError, PgConnection};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppResult,
    files::{self, EntityKind},
    models::ManagedFile,
    schema::{guides, issues, machines, managed_files, solutions, steps},
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRoot {
    Machine(Uuid),
    Issue(Uuid),
    Solution(Uuid),
    Guide(Uuid),
    Step(Uuid),
}

impl DeleteRoot {
    fn label(&self) -> &'static str {
        match self {
            DeleteRoot::Machine(_) => "machine",
            DeleteRoot::Issue(_) => "issue",
            DeleteRoot::Solution(_) => "solution",
            DeleteRoot::Guide(_) => "guide",
            DeleteRoot::Step(_) => "step",
        }
    }

    fn id(&self) -> Uuid {
        match *self {
            DeleteRoot::Machine(id)
            | DeleteRoot::Issue(id)
            | DeleteRoot::Solution(id)
            | DeleteRoot::Guide(id)
            | DeleteRoot::Step(id) => id,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Descendants {
    pub machines: Vec<Uuid>,
    pub issues: Vec<Uuid>,
    pub solutions: Vec<Uuid>,
    pub guides: Vec<Uuid>,
    pub steps: Vec<Uuid>,
}

pub fn collect_descendants(conn: &mut PgConnection, root: DeleteRoot) -> QueryResult<Descendants> {
    let mut found = Descendants::default();
    match root {
        DeleteRoot::Machine(id) => {
            found.machines.push(id);
            found.issues = issues::table
                .filter(issues::machine_id.eq(id))
                .select(issues::id)
                .load(conn)?;
        }
        DeleteRoot::Issue(id) => found.issues.push(id),
        DeleteRoot::Solution(id) => found.solutions.push(id),
        DeleteRoot::Guide(id) => found.guides.push(id),
        DeleteRoot::Step(id) => found.steps.push(id),
    }

    if !found.issues.is_empty() {
        let ids: Vec<Uuid> = solutions::table
            .filter(solutions::issue_id.eq_any(&found.issues))
            .select(solutions::id)
            .load(conn)?;
        found.solutions.extend(ids);
    }
    if !found.solutions.is_empty() {
        let ids: Vec<Uuid> = guides::table
            .filter(guides::solution_id.eq_any(&found.solutions))
            .select(guides::id)
            .load(conn)?;
        found.guides.extend(ids);
    }
    if !found.guides.is_empty() {
        let ids: Vec<Uuid> = steps::table
            .filter(steps::guide_id.eq_any(&found.guides))
            .select(steps::id)
            .load(conn)?;
        found.steps.extend(ids);
    }
    Ok(found)
}

fn delete_file_rows(
    conn: &mut PgConnection,
    kind: EntityKind,
    ids: &[Uuid],
) -> QueryResult<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    diesel::delete(
        managed_files::table
            .filter(managed_files::entity_kind.eq(kind))
            .filter(managed_files::entity_id.eq_any(ids)),
    )
    .returning(managed_files::s3_key)
    .get_results(conn)
}

fn delete_root_row(conn: &mut PgConnection, root: DeleteRoot) -> QueryResult<usize> {
    match root {
        DeleteRoot::Machine(id) => diesel::delete(machines::table.find(id)).execute(conn),
        DeleteRoot::Issue(id) => diesel::delete(issues::table.find(id)).execute(conn),
        DeleteRoot::Solution(id) => diesel::delete(solutions::table.find(id)).execute(conn),
        DeleteRoot::Guide(id) => diesel::delete(guides::table.find(id)).execute(conn),
        DeleteRoot::Step(id) => diesel::delete(steps::table.find(id)).execute(conn),
    }
}

pub fn delete_rows(conn: &mut PgConnection, root: DeleteRoot) -> QueryResult<Vec<String>> {
    let found = collect_descendants(conn, root)?;
    let mut keys = delete_file_rows(conn, EntityKind::Machine, &found.machines)?;
    keys.extend(delete_file_rows(conn, EntityKind::Issue, &found.issues)?);
    keys.extend(delete_file_rows(conn, EntityKind::Step, &found.steps)?);

    if delete_root_row(conn, root)? == 0 {
        return Err(DieselError::NotFound);
    }
    Ok(keys)
}

// Rows go in one transaction; objects are removed after commit and failures
// only become report warnings.
pub async fn delete_entity(state: &AppState, root: DeleteRoot) -> AppResult<CleanupReport> {
    let keys = {
        let mut conn = state.db()?;
        conn.transaction(|conn| delete_rows(conn, root))?
    };

    let report = remove_stored(state, &keys).await;
    info!(
        entity = root.label(),
        entity_id = %root.id(),
        files_removed = report.files_removed,
        warnings = report.warnings.len(),
        "entity deleted"
    );
    Ok(report)
}

pub async fn remove_stored(state: &AppState, keys: &[String]) -> CleanupReport {
    let warnings = files::remove_objects(state.storage.as_ref(), keys).await;
    CleanupReport {
        files_removed: keys.len() - warnings.len(),
        warnings,
    }
}

pub fn orphan_files(conn: &mut PgConnection) -> QueryResult<Vec<ManagedFile>> {
    let mut orphans: Vec<ManagedFile> = managed_files::table
        .filter(managed_files::entity_kind.eq(EntityKind::Machine))
        .filter(not(managed_files::entity_id.eq_any(machines::table.select(machines::id))))
        .load(conn)?;
    orphans.extend(
        managed_files::table
            .filter(managed_files::entity_kind.eq(EntityKind::Issue))
            .filter(not(managed_files::entity_id.eq_any(issues::table.select(issues::id))))
            .load::<ManagedFile>(conn)?,
    );
    orphans.extend(
        managed_files::table
            .filter(managed_files::entity_kind.eq(EntityKind::Step))
            .filter(not(managed_files::entity_id.eq_any(steps::table.select(steps::id))))
            .load::<ManagedFile>(conn)?,
    );
    Ok(orphans)
}

pub async fn purge_orphan_files(state: &AppState) -> AppResult<CleanupReport> {
    let keys = {
        let mut conn = state.db()?;
        conn.transaction::<_, DieselError, _>(|conn| {
            let orphans = orphan_files(conn)?;
            let ids: Vec<Uuid> = orphans.iter().map(|file| file.id).collect();
            if !ids.is_empty() {
                diesel::delete(managed_files::table.filter(managed_files::id.eq_any(&ids)))
                    .execute(conn)?;
            }
            Ok(orphans.into_iter().map(|file| file.s3_key).collect::<Vec<_>>())
        })?
    };

    let report = remove_stored(state, &keys).await;
    if !report.warnings.is_empty() {
        warn!(
            failed = report.warnings.len(),
            "some orphaned objects could not be removed"
        );
    }
    info!(files_removed = report.files_removed, "orphaned files purged");
    Ok(report)
}
