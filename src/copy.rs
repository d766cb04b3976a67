use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::{
    pg::PgConnection,
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    files::{self, EntityRef, FileDuplicate},
    graph::{GraphCounts, MachineGraph},
    models::{
        Machine, ManagedFile, NewGuide, NewIssue, NewMachine, NewMachineCopy, NewManagedFile,
        NewSolution, NewStep,
    },
    schema::{guides, issues, machine_copies, machines, managed_files, solutions, steps},
    state::AppState,
};

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("machine not found")]
    NotFound,
    #[error("{0}")]
    InvalidOperation(&'static str),
    #[error("a copy of this template already exists")]
    AlreadyExists { machine_id: Uuid },
    #[error("failed to duplicate files: {0}")]
    Storage(anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
    #[error("database pool error: {0}")]
    Pool(String),
}

pub type CopyResult<T> = Result<T, CopyError>;

impl From<CopyError> for AppError {
    fn from(value: CopyError) -> Self {
        match value {
            CopyError::NotFound => AppError::not_found(),
            CopyError::InvalidOperation(message) => AppError::bad_request(message),
            CopyError::AlreadyExists { machine_id } => {
                AppError::bad_request("a copy of this template already exists")
                    .with_machine_id(machine_id)
            }
            other => AppError::internal(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOutcome {
    pub machine_id: Uuid,
    pub counts: GraphCounts,
}

#[derive(Debug, Clone)]
pub struct ClonePlan {
    pub machine: NewMachine,
    pub marker: NewMachineCopy,
    pub issues: Vec<NewIssue>,
    pub solutions: Vec<NewSolution>,
    pub guides: Vec<NewGuide>,
    pub steps: Vec<NewStep>,
    pub files: Vec<FileDuplicate>,
}

impl ClonePlan {
    pub fn build(graph: &MachineGraph, requesting_user: Uuid, now: NaiveDateTime) -> Self {
        let source = &graph.machine;
        let machine_id = Uuid::new_v4();
        let machine = NewMachine {
            id: machine_id,
            name: source.name.clone(),
            model: source.model.clone(),
            series: source.series.clone(),
            description: source.description.clone(),
            category: source.category.clone(),
            manufacturer: source.manufacturer.clone(),
            department: source.department.clone(),
            machine_type: source.machine_type.clone(),
            owner_id: requesting_user,
            is_public: false,
            is_template: false,
        };
        let marker = NewMachineCopy {
            id: Uuid::new_v4(),
            original_template_id: Some(source.id),
            user_id: requesting_user,
            machine_id,
        };

        // Cloned rows share one transaction timestamp; offsetting each by its
        // position keeps the template's listing order.
        let mut stamps = Stamps::new(now);
        let mut plan = Self {
            machine,
            marker,
            issues: Vec::with_capacity(graph.issues.len()),
            solutions: Vec::new(),
            guides: Vec::new(),
            steps: Vec::new(),
            files: duplicates(&graph.files, EntityRef::machine(machine_id), &mut stamps),
        };

        for node in &graph.issues {
            let issue_id = Uuid::new_v4();
            plan.issues.push(NewIssue {
                id: issue_id,
                machine_id,
                title: node.issue.title.clone(),
                description: node.issue.description.clone(),
                error_code: node.issue.error_code.clone(),
                keywords: node.issue.keywords.clone(),
                created_by: Some(requesting_user),
                created_at: stamps.next(),
            });
            plan.files.extend(duplicates(
                &node.files,
                EntityRef::issue(issue_id),
                &mut stamps,
            ));

            for solution_node in &node.solutions {
                let solution_id = Uuid::new_v4();
                plan.solutions.push(NewSolution {
                    id: solution_id,
                    issue_id,
                    description: solution_node.solution.description.clone(),
                    created_by: Some(requesting_user),
                    created_at: stamps.next(),
                });

                let Some(guide_node) = &solution_node.guide else {
                    continue;
                };
                let guide_id = Uuid::new_v4();
                plan.guides.push(NewGuide {
                    id: guide_id,
                    solution_id,
                    title: guide_node.guide.title.clone(),
                    created_by: Some(requesting_user),
                });

                for step_node in &guide_node.steps {
                    let step_id = Uuid::new_v4();
                    plan.steps.push(NewStep {
                        id: step_id,
                        guide_id,
                        step_number: step_node.step.step_number,
                        description: step_node.step.description.clone(),
                        video_urls: step_node.step.video_urls.clone(),
                    });
                    plan.files.extend(duplicates(
                        &step_node.files,
                        EntityRef::step(step_id),
                        &mut stamps,
                    ));
                }
            }
        }

        plan
    }

    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            issues: self.issues.len(),
            solutions: self.solutions.len(),
            guides: self.guides.len(),
            steps: self.steps.len(),
            files: self.files.len(),
        }
    }

    fn object_keys(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|duplicate| duplicate.record.s3_key.clone())
            .collect()
    }

    // Parent-first; caller owns the transaction.
    fn insert(&self, conn: &mut PgConnection) -> QueryResult<()> {
        diesel::insert_into(machines::table)
            .values(&self.machine)
            .execute(conn)?;
        diesel::insert_into(machine_copies::table)
            .values(&self.marker)
            .execute(conn)?;

        if !self.issues.is_empty() {
            diesel::insert_into(issues::table)
                .values(&self.issues)
                .execute(conn)?;
        }
        if !self.solutions.is_empty() {
            diesel::insert_into(solutions::table)
                .values(&self.solutions)
                .execute(conn)?;
        }
        if !self.guides.is_empty() {
            diesel::insert_into(guides::table)
                .values(&self.guides)
                .execute(conn)?;
        }
        if !self.steps.is_empty() {
            diesel::insert_into(steps::table)
                .values(&self.steps)
                .execute(conn)?;
        }
        if !self.files.is_empty() {
            let records: Vec<&NewManagedFile> =
                self.files.iter().map(|duplicate| &duplicate.record).collect();
            diesel::insert_into(managed_files::table)
                .values(records)
                .execute(conn)?;
        }
        Ok(())
    }
}

pub(crate) struct Stamps {
    anchor: NaiveDateTime,
    position: i64,
}

impl Stamps {
    pub(crate) fn new(anchor: NaiveDateTime) -> Self {
        Self {
            anchor,
            position: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Option<NaiveDateTime> {
        self.position += 1;
        Some(self.anchor + ChronoDuration::microseconds(self.position))
    }
}

fn duplicates(files: &[ManagedFile], target: EntityRef, stamps: &mut Stamps) -> Vec<FileDuplicate> {
    files
        .iter()
        .map(|file| {
            let mut duplicate = files::plan_duplicate(file, target);
            duplicate.record.uploaded_at = stamps.next();
            duplicate
        })
        .collect()
}

pub fn existing_copy(
    conn: &mut PgConnection,
    user_id: Uuid,
    template_id: Uuid,
) -> QueryResult<Option<Uuid>> {
    machine_copies::table
        .filter(machine_copies::user_id.eq(user_id))
        .filter(machine_copies::original_template_id.eq(template_id))
        .select(machine_copies::machine_id)
        .first(conn)
        .optional()
}

pub async fn copy_template(
    state: &AppState,
    template_id: Uuid,
    requesting_user: Uuid,
) -> CopyResult<CopyOutcome> {
    let plan = {
        let mut conn = connection(state)?;
        let template: Machine = machines::table
            .find(template_id)
            .first(&mut conn)
            .optional()?
            .ok_or(CopyError::NotFound)?;

        if !template.is_template {
            return Err(CopyError::InvalidOperation("only templates can be copied"));
        }

        if let Some(machine_id) = existing_copy(&mut conn, requesting_user, template_id)? {
            info!(
                template_id = %template_id,
                user_id = %requesting_user,
                machine_id = %machine_id,
                "template already copied"
            );
            return Err(CopyError::AlreadyExists { machine_id });
        }

        let graph = MachineGraph::load(&mut conn, template)?;
        ClonePlan::build(&graph, requesting_user, Utc::now().naive_utc())
    };

    info!(
        template_id = %template_id,
        user_id = %requesting_user,
        files = plan.files.len(),
        "copying template"
    );

    files::duplicate_objects(state.storage.as_ref(), &plan.files)
        .await
        .map_err(|err| {
            warn!(template_id = %template_id, error = %err, "template copy aborted during file duplication");
            CopyError::Storage(err)
        })?;

    let committed = connection(state).and_then(|mut conn| {
        conn.transaction::<_, DieselError, _>(|conn| plan.insert(conn))
            .map_err(|err| resolve_conflict(&mut conn, err, requesting_user, template_id))
    });

    match committed {
        Ok(()) => {
            let counts = plan.counts();
            info!(
                template_id = %template_id,
                user_id = %requesting_user,
                machine_id = %plan.machine.id,
                issues = counts.issues,
                solutions = counts.solutions,
                guides = counts.guides,
                steps = counts.steps,
                files = counts.files,
                "template copied"
            );
            Ok(CopyOutcome {
                machine_id: plan.machine.id,
                counts,
            })
        }
        Err(err) => {
            let failures = files::remove_objects(state.storage.as_ref(), &plan.object_keys()).await;
            if !failures.is_empty() {
                warn!(
                    template_id = %template_id,
                    leftover_objects = failures.len(),
                    "could not remove every duplicated file after aborted copy"
                );
            }
            Err(err)
        }
    }
}

// The unique marker rejected us: a concurrent copy committed first.
fn resolve_conflict(
    conn: &mut PgConnection,
    err: DieselError,
    requesting_user: Uuid,
    template_id: Uuid,
) -> CopyError {
    if !matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    ) {
        return CopyError::Database(err);
    }

    match existing_copy(conn, requesting_user, template_id) {
        Ok(Some(machine_id)) => {
            info!(
                template_id = %template_id,
                user_id = %requesting_user,
                machine_id = %machine_id,
                "concurrent template copy detected"
            );
            CopyError::AlreadyExists { machine_id }
        }
        Ok(None) => CopyError::Database(err),
        Err(lookup) => CopyError::Database(lookup),
    }
}

fn connection(state: &AppState) -> CopyResult<crate::db::PgPooledConnection> {
    state
        .pool
        .get()
        .map_err(|err| CopyError::Pool(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        files::{object_key, EntityKind, FileKind},
        graph::{GuideNode, IssueNode, SolutionNode, StepNode},
        models::{Guide, Issue, Solution, Step},
    };
    use axum::http::StatusCode;
    use std::collections::HashSet;

    fn now() -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn file(entity: EntityRef, kind: FileKind) -> ManagedFile {
        let id = Uuid::new_v4();
        ManagedFile {
            id,
            entity_kind: entity.kind,
            entity_id: entity.id,
            file_kind: kind,
            s3_key: object_key(entity, id),
            original_name: "photo.jpg".to_string(),
            content_type: Some("image/jpeg".to_string()),
            size_bytes: 3,
            checksum: "00".repeat(32),
            uploaded_at: now(),
        }
    }

    fn template(owner: Uuid) -> Machine {
        Machine {
            id: Uuid::new_v4(),
            name: "Haas VF-2".to_string(),
            model: "VF-2".to_string(),
            series: Some("VF".to_string()),
            description: Some("Vertical machining center".to_string()),
            category: Some("CNC".to_string()),
            manufacturer: Some("Haas".to_string()),
            department: Some("Machining".to_string()),
            machine_type: Some("Mill".to_string()),
            owner_id: owner,
            is_public: true,
            is_template: true,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn issue(machine_id: Uuid, title: &str) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            machine_id,
            title: title.to_string(),
            description: format!("{title} description"),
            error_code: Some("E-100".to_string()),
            keywords: "spindle, coolant".to_string(),
            created_by: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn solution(issue_id: Uuid) -> Solution {
        Solution {
            id: Uuid::new_v4(),
            issue_id,
            description: "Replace the sensor".to_string(),
            created_by: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn guide_with_steps(solution_id: Uuid, numbers: &[i32]) -> GuideNode {
        let guide = Guide {
            id: Uuid::new_v4(),
            solution_id,
            title: "Sensor replacement".to_string(),
            created_by: None,
            created_at: now(),
            updated_at: now(),
        };
        let steps = numbers
            .iter()
            .map(|number| {
                let step = Step {
                    id: Uuid::new_v4(),
                    guide_id: guide.id,
                    step_number: *number,
                    description: format!("step {number}"),
                    video_urls: vec![format!("https://videos.example.com/{number}")],
                };
                let files = vec![file(EntityRef::step(step.id), FileKind::Image)];
                StepNode { step, files }
            })
            .collect();
        GuideNode { guide, steps }
    }

    fn sample_graph() -> MachineGraph {
        let machine = template(Uuid::new_v4());
        let first = issue(machine.id, "Spindle overheating");
        let second = issue(machine.id, "Coolant leak");

        let plain = solution(second.id);
        let guided = solution(second.id);
        let guide = guide_with_steps(guided.id, &[1, 2, 3]);

        MachineGraph {
            files: vec![
                file(EntityRef::machine(machine.id), FileKind::Image),
                file(EntityRef::machine(machine.id), FileKind::Manual),
            ],
            issues: vec![
                IssueNode {
                    files: vec![file(EntityRef::issue(first.id), FileKind::Image)],
                    issue: first,
                    solutions: Vec::new(),
                },
                IssueNode {
                    files: Vec::new(),
                    issue: second,
                    solutions: vec![
                        SolutionNode {
                            solution: plain,
                            guide: None,
                        },
                        SolutionNode {
                            solution: guided,
                            guide: Some(guide),
                        },
                    ],
                },
            ],
            machine,
        }
    }

    #[test]
    fn plan_mirrors_graph_shape() {
        let graph = sample_graph();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), now());

        assert_eq!(plan.counts(), graph.counts());
        assert_eq!(
            plan.counts(),
            GraphCounts {
                issues: 2,
                solutions: 2,
                guides: 1,
                steps: 3,
                files: 6,
            }
        );
    }

    #[test]
    fn copy_is_owned_by_requesting_user_and_not_a_template() {
        let graph = sample_graph();
        let user = Uuid::new_v4();
        let plan = ClonePlan::build(&graph, user, now());

        assert_ne!(plan.machine.id, graph.machine.id);
        assert_eq!(plan.machine.owner_id, user);
        assert!(!plan.machine.is_template);
        assert!(!plan.machine.is_public);
        assert_eq!(plan.machine.name, graph.machine.name);
        assert_eq!(plan.machine.manufacturer, graph.machine.manufacturer);
        assert_eq!(plan.machine.machine_type, graph.machine.machine_type);

        assert_eq!(plan.marker.user_id, user);
        assert_eq!(plan.marker.machine_id, plan.machine.id);
        assert_eq!(plan.marker.original_template_id, Some(graph.machine.id));

        assert!(plan.issues.iter().all(|i| i.created_by == Some(user)));
        assert!(plan.solutions.iter().all(|s| s.created_by == Some(user)));
        assert!(plan.guides.iter().all(|g| g.created_by == Some(user)));
    }

    #[test]
    fn plan_shares_no_identity_with_template() {
        let graph = sample_graph();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), now());

        let mut source_ids: HashSet<Uuid> = HashSet::new();
        source_ids.insert(graph.machine.id);
        for node in &graph.issues {
            source_ids.insert(node.issue.id);
            for s in &node.solutions {
                source_ids.insert(s.solution.id);
                if let Some(guide) = &s.guide {
                    source_ids.insert(guide.guide.id);
                    source_ids.extend(guide.steps.iter().map(|step| step.step.id));
                }
            }
        }

        let planned_ids = std::iter::once(plan.machine.id)
            .chain(plan.issues.iter().map(|i| i.id))
            .chain(plan.solutions.iter().map(|s| s.id))
            .chain(plan.guides.iter().map(|g| g.id))
            .chain(plan.steps.iter().map(|s| s.id));
        for id in planned_ids {
            assert!(!source_ids.contains(&id));
        }

        assert!(plan.issues.iter().all(|i| i.machine_id == plan.machine.id));
        for duplicate in &plan.files {
            assert_ne!(duplicate.source_key, duplicate.record.s3_key);
            assert!(!source_ids.contains(&duplicate.record.entity_id));
        }
    }

    #[test]
    fn files_follow_their_cloned_owner() {
        let graph = sample_graph();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), now());

        let machine_files: Vec<_> = plan
            .files
            .iter()
            .filter(|d| d.record.entity_kind == EntityKind::Machine)
            .collect();
        assert_eq!(machine_files.len(), 2);
        assert!(machine_files
            .iter()
            .all(|d| d.record.entity_id == plan.machine.id));
        assert_eq!(
            machine_files
                .iter()
                .filter(|d| d.record.file_kind == FileKind::Manual)
                .count(),
            1
        );

        let issue_file = plan
            .files
            .iter()
            .find(|d| d.record.entity_kind == EntityKind::Issue)
            .expect("issue file planned");
        assert_eq!(issue_file.record.entity_id, plan.issues[0].id);

        let step_ids: HashSet<Uuid> = plan.steps.iter().map(|s| s.id).collect();
        let step_files: Vec<_> = plan
            .files
            .iter()
            .filter(|d| d.record.entity_kind == EntityKind::Step)
            .collect();
        assert_eq!(step_files.len(), 3);
        assert!(step_files
            .iter()
            .all(|d| step_ids.contains(&d.record.entity_id)));
    }

    #[test]
    fn steps_keep_numbers_and_videos_in_order() {
        let graph = sample_graph();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), now());

        let numbers: Vec<i32> = plan.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(
            plan.steps[1].video_urls,
            vec!["https://videos.example.com/2".to_string()]
        );
        assert_eq!(plan.guides[0].solution_id, plan.solutions[1].id);
        assert!(plan.steps.iter().all(|s| s.guide_id == plan.guides[0].id));
    }

    #[test]
    fn cloned_rows_are_stamped_in_template_order() {
        let graph = sample_graph();
        let anchor = now();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), anchor);

        let first = plan.issues[0].created_at.expect("stamped");
        let second = plan.issues[1].created_at.expect("stamped");
        assert!(anchor < first && first < second);

        let solution_stamps: Vec<_> = plan.solutions.iter().map(|s| s.created_at).collect();
        assert!(solution_stamps[0] < solution_stamps[1]);
    }

    #[test]
    fn cloned_files_keep_template_upload_order() {
        let graph = sample_graph();
        let plan = ClonePlan::build(&graph, Uuid::new_v4(), now());

        let machine_sources: Vec<&str> = graph.files.iter().map(|f| f.s3_key.as_str()).collect();
        let machine_copies: Vec<_> = plan
            .files
            .iter()
            .filter(|d| d.record.entity_kind == EntityKind::Machine)
            .collect();
        let copied_sources: Vec<&str> = machine_copies
            .iter()
            .map(|d| d.source_key.as_str())
            .collect();
        assert_eq!(copied_sources, machine_sources);

        let stamps: Vec<NaiveDateTime> = plan
            .files
            .iter()
            .map(|d| d.record.uploaded_at.expect("stamped"))
            .collect();
        assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn copy_errors_map_to_http_statuses() {
        let existing = Uuid::new_v4();
        assert_eq!(
            AppError::from(CopyError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(CopyError::InvalidOperation("only templates can be copied")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(CopyError::AlreadyExists {
                machine_id: existing
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(CopyError::Storage(anyhow::anyhow!("boom"))).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
