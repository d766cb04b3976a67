use diesel::{prelude::*, PgConnection};
use uuid::Uuid;

use crate::{models::Issue, schema::issues};

pub fn tokenize(description: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in description.split_whitespace().map(str::to_lowercase) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

pub fn issue_matches(issue: &Issue, tokens: &[String]) -> bool {
    let haystacks = [
        issue.keywords.to_lowercase(),
        issue.title.to_lowercase(),
        issue.description.to_lowercase(),
    ];
    tokens
        .iter()
        .any(|token| haystacks.iter().any(|field| field.contains(token.as_str())))
}

pub fn filter_matching(candidates: Vec<Issue>, description: &str) -> Vec<Issue> {
    let tokens = tokenize(description);
    if tokens.is_empty() {
        return Vec::new();
    }
    candidates
        .into_iter()
        .filter(|issue| issue_matches(issue, &tokens))
        .collect()
}

pub fn match_issues(
    conn: &mut PgConnection,
    machine_id: Uuid,
    description: &str,
) -> QueryResult<Vec<Issue>> {
    if tokenize(description).is_empty() {
        return Ok(Vec::new());
    }
    let candidates: Vec<Issue> = issues::table
        .filter(issues::machine_id.eq(machine_id))
        .order((issues::created_at.asc(), issues::id.asc()))
        .load(conn)?;
    Ok(filter_matching(candidates, description))
}
