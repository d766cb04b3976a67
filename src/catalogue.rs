use std::collections::HashSet;

use chrono::Utc;
use diesel::{pg::PgConnection, prelude::*, result::Error as DieselError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{
    copy::Stamps,
    models::{NewGuide, NewIssue, NewMachine, NewSolution, NewStep},
    schema::{guides, issues, machines, solutions, steps},
};

pub const BUNDLED_CATALOGUE: &str = include_str!("../catalogue/templates.json");

#[derive(Debug, Error)]
pub enum CatalogueError {
    #[error("failed to parse catalogue: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid catalogue: {0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] DieselError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Catalogue {
    pub machines: Vec<TemplateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub issues: Vec<IssueEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueEntry {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub solutions: Vec<SolutionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolutionEntry {
    pub description: String,
    #[serde(default)]
    pub guide: Option<GuideEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuideEntry {
    #[serde(default)]
    pub title: Option<String>,
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepEntry {
    pub step_number: i32,
    pub description: String,
    #[serde(default)]
    pub video_urls: Vec<String>,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

impl Catalogue {
    pub fn parse(raw: &str) -> Result<Self, CatalogueError> {
        let catalogue: Catalogue = serde_json::from_str(raw)?;
        catalogue.validate()?;
        Ok(catalogue)
    }

    pub fn bundled() -> Result<Self, CatalogueError> {
        Self::parse(BUNDLED_CATALOGUE)
    }

    fn validate(&self) -> Result<(), CatalogueError> {
        let mut names = HashSet::new();
        for machine in &self.machines {
            if machine.name.trim().is_empty() || machine.model.trim().is_empty() {
                return Err(CatalogueError::Invalid(
                    "every machine needs a name and a model".to_string(),
                ));
            }
            if !names.insert(machine.name.trim()) {
                return Err(CatalogueError::Invalid(format!(
                    "machine '{}' is listed twice",
                    machine.name
                )));
            }
            for issue in &machine.issues {
                if issue.title.trim().is_empty() {
                    return Err(CatalogueError::Invalid(format!(
                        "'{}' has an issue without a title",
                        machine.name
                    )));
                }
                let steps = issue
                    .solutions
                    .iter()
                    .filter_map(|solution| solution.guide.as_ref())
                    .flat_map(|guide| guide.steps.iter());
                for step in steps {
                    if step.step_number < 1 {
                        return Err(CatalogueError::Invalid(format!(
                            "'{}' has a step numbered {} under '{}'",
                            machine.name, step.step_number, issue.title
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// Templates are matched by name among the owner's templates; existing ones are
// left untouched so the command can be rerun.
pub fn seed_templates(
    conn: &mut PgConnection,
    catalogue: &Catalogue,
    owner_id: Uuid,
) -> Result<SeedReport, CatalogueError> {
    let mut report = SeedReport::default();

    for entry in &catalogue.machines {
        let name = entry.name.trim();
        let existing: Option<Uuid> = machines::table
            .filter(machines::owner_id.eq(owner_id))
            .filter(machines::is_template.eq(true))
            .filter(machines::name.eq(name))
            .select(machines::id)
            .first(conn)
            .optional()?;

        if let Some(machine_id) = existing {
            info!(machine_id = %machine_id, name = %name, "template already seeded");
            report.skipped.push(name.to_string());
            continue;
        }

        let machine_id =
            conn.transaction::<_, DieselError, _>(|conn| insert_entry(conn, entry, owner_id))?;
        info!(
            machine_id = %machine_id,
            name = %name,
            issues = entry.issues.len(),
            "template seeded"
        );
        report.created.push(name.to_string());
    }

    Ok(report)
}

fn insert_entry(
    conn: &mut PgConnection,
    entry: &TemplateEntry,
    owner_id: Uuid,
) -> QueryResult<Uuid> {
    let machine_id = Uuid::new_v4();
    diesel::insert_into(machines::table)
        .values(&NewMachine {
            id: machine_id,
            name: entry.name.trim().to_string(),
            model: entry.model.trim().to_string(),
            series: entry.series.clone(),
            description: entry.description.clone(),
            category: entry.category.clone(),
            manufacturer: entry.manufacturer.clone(),
            department: entry.department.clone(),
            machine_type: entry.machine_type.clone(),
            owner_id,
            is_public: entry.is_public,
            is_template: true,
        })
        .execute(conn)?;

    let mut stamps = Stamps::new(Utc::now().naive_utc());
    let mut new_issues = Vec::new();
    let mut new_solutions = Vec::new();
    let mut new_guides = Vec::new();
    let mut new_steps = Vec::new();

    for issue in &entry.issues {
        let issue_id = Uuid::new_v4();
        new_issues.push(NewIssue {
            id: issue_id,
            machine_id,
            title: issue.title.trim().to_string(),
            description: issue.description.clone(),
            error_code: issue.error_code.clone(),
            keywords: issue.keywords.clone(),
            created_by: Some(owner_id),
            created_at: stamps.next(),
        });

        for solution in &issue.solutions {
            let solution_id = Uuid::new_v4();
            new_solutions.push(NewSolution {
                id: solution_id,
                issue_id,
                description: solution.description.clone(),
                created_by: Some(owner_id),
                created_at: stamps.next(),
            });

            let Some(guide) = &solution.guide else {
                continue;
            };
            let guide_id = Uuid::new_v4();
            new_guides.push(NewGuide {
                id: guide_id,
                solution_id,
                title: guide
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Guide for {}", issue.title.trim())),
                created_by: Some(owner_id),
            });

            let mut ordered: Vec<&StepEntry> = guide.steps.iter().collect();
            ordered.sort_by_key(|step| step.step_number);
            new_steps.extend(ordered.into_iter().map(|step| NewStep {
                id: Uuid::new_v4(),
                guide_id,
                step_number: step.step_number,
                description: step.description.clone(),
                video_urls: step.video_urls.clone(),
            }));
        }
    }

    if !new_issues.is_empty() {
        diesel::insert_into(issues::table)
            .values(&new_issues)
            .execute(conn)?;
    }
    if !new_solutions.is_empty() {
        diesel::insert_into(solutions::table)
            .values(&new_solutions)
            .execute(conn)?;
    }
    if !new_guides.is_empty() {
        diesel::insert_into(guides::table)
            .values(&new_guides)
            .execute(conn)?;
    }
    if !new_steps.is_empty() {
        diesel::insert_into(steps::table)
            .values(&new_steps)
            .execute(conn)?;
    }

    Ok(machine_id)
}
