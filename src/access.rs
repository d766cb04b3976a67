use diesel::{prelude::*, PgConnection};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    error::{AppError, AppResult},
    files::{EntityKind, EntityRef},
    models::Machine,
    schema::{guides, issues, machines, solutions, steps},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    View,
    Modify,
}

pub fn can_view(machine: &Machine, user_id: Uuid) -> bool {
    machine.owner_id == user_id || machine.is_template || machine.is_public
}

pub fn can_modify(machine: &Machine, user_id: Uuid) -> bool {
    machine.owner_id == user_id
}

pub fn authorize(machine: &Machine, user: &AuthenticatedUser, access: Access) -> AppResult<()> {
    if !can_view(machine, user.user_id) {
        return Err(AppError::not_found());
    }
    if access == Access::Modify && !can_modify(machine, user.user_id) {
        return Err(AppError::forbidden());
    }
    Ok(())
}

pub fn machine(
    conn: &mut PgConnection,
    machine_id: Uuid,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine: Machine = machines::table.find(machine_id).first(conn)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}

pub fn machine_of_issue(conn: &mut PgConnection, issue_id: Uuid) -> QueryResult<Machine> {
    issues::table
        .inner_join(machines::table)
        .filter(issues::id.eq(issue_id))
        .select(machines::all_columns)
        .first(conn)
}

pub fn machine_of_solution(conn: &mut PgConnection, solution_id: Uuid) -> QueryResult<Machine> {
    solutions::table
        .inner_join(issues::table.inner_join(machines::table))
        .filter(solutions::id.eq(solution_id))
        .select(machines::all_columns)
        .first(conn)
}

pub fn machine_of_guide(conn: &mut PgConnection, guide_id: Uuid) -> QueryResult<Machine> {
    guides::table
        .inner_join(solutions::table.inner_join(issues::table.inner_join(machines::table)))
        .filter(guides::id.eq(guide_id))
        .select(machines::all_columns)
        .first(conn)
}

pub fn machine_of_step(conn: &mut PgConnection, step_id: Uuid) -> QueryResult<Machine> {
    steps::table
        .inner_join(
            guides::table
                .inner_join(solutions::table.inner_join(issues::table.inner_join(machines::table))),
        )
        .filter(steps::id.eq(step_id))
        .select(machines::all_columns)
        .first(conn)
}

pub fn machine_of_entity(conn: &mut PgConnection, entity: EntityRef) -> QueryResult<Machine> {
    match entity.kind {
        EntityKind::Machine => machines::table.find(entity.id).first(conn),
        EntityKind::Issue => machine_of_issue(conn, entity.id),
        EntityKind::Step => machine_of_step(conn, entity.id),
    }
}

pub fn issue(
    conn: &mut PgConnection,
    issue_id: Uuid,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine = machine_of_issue(conn, issue_id)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}

pub fn solution(
    conn: &mut PgConnection,
    solution_id: Uuid,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine = machine_of_solution(conn, solution_id)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}

pub fn guide(
    conn: &mut PgConnection,
    guide_id: Uuid,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine = machine_of_guide(conn, guide_id)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}

pub fn step(
    conn: &mut PgConnection,
    step_id: Uuid,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine = machine_of_step(conn, step_id)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}

pub fn entity(
    conn: &mut PgConnection,
    entity: EntityRef,
    user: &AuthenticatedUser,
    access: Access,
) -> AppResult<Machine> {
    let machine = machine_of_entity(conn, entity)?;
    authorize(&machine, user, access)?;
    Ok(machine)
}
