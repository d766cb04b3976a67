use std::env;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use repairmate::{
    auth::{
        jwt::JwtService,
        password::{check_password_length, hash_password},
        ROLE_ADMIN,
    },
    catalogue::{self, Catalogue},
    cleanup,
    config::AppConfig,
    db,
    models::User,
    schema::users,
    state::AppState,
    storage::S3Storage,
};

const USAGE: &str = "Usage: maintenance <purge-orphan-files | promote-admin <username> | reset-password <username> <password> | seed-templates <owner-username> [catalogue.json]>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("purge-orphan-files") => purge_orphan_files().await?,
        Some("promote-admin") => {
            let username = args.next().ok_or_else(|| anyhow!(USAGE))?;
            promote_admin(&username)?;
        }
        Some("reset-password") => {
            let username = args.next().ok_or_else(|| anyhow!(USAGE))?;
            let password = args.next().ok_or_else(|| anyhow!(USAGE))?;
            reset_password(&username, &password)?;
        }
        Some("seed-templates") => {
            let owner = args.next().ok_or_else(|| anyhow!(USAGE))?;
            seed_templates(&owner, args.next().as_deref())?;
        }
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        "loaded configuration"
    );
    Ok(config)
}

async fn purge_orphan_files() -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let storage = Arc::new(S3Storage::from_config(&config).await?);
    let jwt = JwtService::from_config(&config)?;
    let state = AppState::new(pool, config, storage, jwt);

    let report = cleanup::purge_orphan_files(&state)
        .await
        .map_err(|err| anyhow!("failed to purge orphan files: {}", err.message()))?;

    println!("Removed {} orphaned files.", report.files_removed);
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn promote_admin(username: &str) -> Result<()> {
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let updated = diesel::update(users::table.filter(users::username.eq(username)))
        .set(users::role.eq(ROLE_ADMIN))
        .execute(&mut conn)
        .context("failed to update user role")?;
    if updated == 0 {
        return Err(anyhow!("user {username} not found"));
    }

    println!("{username} is now an admin.");
    Ok(())
}

fn reset_password(username: &str, password: &str) -> Result<()> {
    check_password_length(password).map_err(|message| anyhow!(message))?;
    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let password_hash = hash_password(password)?;
    let updated = diesel::update(users::table.filter(users::username.eq(username)))
        .set(users::password_hash.eq(password_hash))
        .execute(&mut conn)
        .context("failed to update password")?;
    if updated == 0 {
        return Err(anyhow!("user {username} not found"));
    }

    println!("Password for {username} updated.");
    Ok(())
}

fn seed_templates(owner: &str, catalogue_path: Option<&str>) -> Result<()> {
    let catalogue = match catalogue_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read catalogue {path}"))?;
            Catalogue::parse(&raw)?
        }
        None => Catalogue::bundled()?,
    };

    let config = load_config()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let mut conn = pool.get().context("failed to get database connection")?;

    let owner: User = users::table
        .filter(users::username.eq(owner))
        .first(&mut conn)
        .optional()
        .context("failed to load template owner")?
        .ok_or_else(|| anyhow!("user {owner} not found"))?;
    if owner.role != ROLE_ADMIN {
        return Err(anyhow!(
            "templates must be owned by an admin; run promote-admin {} first",
            owner.username
        ));
    }

    let report = catalogue::seed_templates(&mut conn, &catalogue, owner.id)?;
    for name in &report.created {
        println!("Seeded template {name}.");
    }
    for name in &report.skipped {
        println!("Template {name} already exists, skipped.");
    }
    Ok(())
}
