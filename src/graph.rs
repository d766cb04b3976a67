use std::collections::HashMap;

use diesel::{prelude::*, PgConnection};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    files::{self, EntityKind, EntityRef},
    models::{Guide, Issue, Machine, ManagedFile, Solution, Step},
    schema::{guides, issues, solutions, steps},
};

#[derive(Debug, Clone)]
pub struct MachineGraph {
    pub machine: Machine,
    pub files: Vec<ManagedFile>,
    pub issues: Vec<IssueNode>,
}

#[derive(Debug, Clone)]
pub struct IssueNode {
    pub issue: Issue,
    pub files: Vec<ManagedFile>,
    pub solutions: Vec<SolutionNode>,
}

#[derive(Debug, Clone)]
pub struct SolutionNode {
    pub solution: Solution,
    pub guide: Option<GuideNode>,
}

#[derive(Debug, Clone)]
pub struct GuideNode {
    pub guide: Guide,
    pub steps: Vec<StepNode>,
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub step: Step,
    pub files: Vec<ManagedFile>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub issues: usize,
    pub solutions: usize,
    pub guides: usize,
    pub steps: usize,
    pub files: usize,
}

impl MachineGraph {
    pub fn load(conn: &mut PgConnection, machine: Machine) -> QueryResult<Self> {
        let issue_rows: Vec<Issue> = Issue::belonging_to(&machine)
            .order((issues::created_at.asc(), issues::id.asc()))
            .load(conn)?;
        let files = files::list_files(conn, EntityRef::machine(machine.id))?;
        let issues = issue_nodes(conn, issue_rows)?;

        Ok(Self {
            machine,
            files,
            issues,
        })
    }

    pub fn counts(&self) -> GraphCounts {
        let mut counts = GraphCounts {
            issues: self.issues.len(),
            files: self.files.len(),
            ..GraphCounts::default()
        };
        for issue in &self.issues {
            counts.files += issue.files.len();
            counts.solutions += issue.solutions.len();
            for guide in issue.solutions.iter().filter_map(|s| s.guide.as_ref()) {
                counts.guides += 1;
                counts.steps += guide.steps.len();
                counts.files += guide.steps.iter().map(|step| step.files.len()).sum::<usize>();
            }
        }
        counts
    }
}

pub fn issue_nodes(conn: &mut PgConnection, issue_rows: Vec<Issue>) -> QueryResult<Vec<IssueNode>> {
    let solution_rows: Vec<Solution> = Solution::belonging_to(&issue_rows)
        .order((solutions::created_at.asc(), solutions::id.asc()))
        .load(conn)?;
    let issue_ids: Vec<Uuid> = issue_rows.iter().map(|issue| issue.id).collect();
    let mut issue_files = group_files(files::list_files_for(conn, EntityKind::Issue, &issue_ids)?);

    let mut solutions_by_issue: HashMap<Uuid, Vec<SolutionNode>> = HashMap::new();
    for node in solution_nodes(conn, solution_rows)? {
        solutions_by_issue
            .entry(node.solution.issue_id)
            .or_default()
            .push(node);
    }

    Ok(issue_rows
        .into_iter()
        .map(|issue| IssueNode {
            files: issue_files.remove(&issue.id).unwrap_or_default(),
            solutions: solutions_by_issue.remove(&issue.id).unwrap_or_default(),
            issue,
        })
        .collect())
}

pub fn solution_nodes(
    conn: &mut PgConnection,
    solution_rows: Vec<Solution>,
) -> QueryResult<Vec<SolutionNode>> {
    let guide_rows: Vec<Guide> = Guide::belonging_to(&solution_rows)
        .order(guides::id.asc())
        .load(conn)?;

    let mut guide_by_solution: HashMap<Uuid, GuideNode> = guide_nodes(conn, guide_rows)?
        .into_iter()
        .map(|node| (node.guide.solution_id, node))
        .collect();

    Ok(solution_rows
        .into_iter()
        .map(|solution| SolutionNode {
            guide: guide_by_solution.remove(&solution.id),
            solution,
        })
        .collect())
}

pub fn guide_nodes(conn: &mut PgConnection, guide_rows: Vec<Guide>) -> QueryResult<Vec<GuideNode>> {
    let step_rows: Vec<Step> = Step::belonging_to(&guide_rows)
        .order((steps::step_number.asc(), steps::id.asc()))
        .load(conn)?;
    let step_ids: Vec<Uuid> = step_rows.iter().map(|step| step.id).collect();
    let mut step_files = group_files(files::list_files_for(conn, EntityKind::Step, &step_ids)?);

    let mut steps_by_guide: HashMap<Uuid, Vec<StepNode>> = HashMap::new();
    for step in step_rows {
        let files = step_files.remove(&step.id).unwrap_or_default();
        steps_by_guide
            .entry(step.guide_id)
            .or_default()
            .push(StepNode { step, files });
    }

    Ok(guide_rows
        .into_iter()
        .map(|guide| GuideNode {
            steps: steps_by_guide.remove(&guide.id).unwrap_or_default(),
            guide,
        })
        .collect())
}

pub fn step_node(conn: &mut PgConnection, step: Step) -> QueryResult<StepNode> {
    let files = files::list_files(conn, EntityRef::step(step.id))?;
    Ok(StepNode { step, files })
}

fn group_files(rows: Vec<ManagedFile>) -> HashMap<Uuid, Vec<ManagedFile>> {
    let mut grouped: HashMap<Uuid, Vec<ManagedFile>> = HashMap::new();
    for file in rows {
        grouped.entry(file.entity_id).or_default().push(file);
    }
    grouped
}
