use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use repairmate::auth::jwt::JwtService;
use repairmate::config::AppConfig;
use repairmate::db::{self, PgPool};
use repairmate::files::{object_key, EntityKind, EntityRef, FileKind};
use repairmate::models::{
    NewGuide, NewIssue, NewMachine, NewManagedFile, NewSolution, NewStep, NewUser,
};
use repairmate::routes;
use repairmate::schema::{
    guides, issues, machine_copies, machines, managed_files, solutions, steps, users,
};
use repairmate::state::AppState;
use repairmate::storage::ObjectStorage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tower::util::ServiceExt;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
    failing_copies: Mutex<Option<String>>,
    copy_gate: Mutex<Option<Arc<Semaphore>>>,
    held_copies: AtomicUsize,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        _content_disposition: Option<String>,
    ) -> Result<()> {
        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type,
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<()> {
        let gate = self.copy_gate.lock().await.clone();
        if let Some(gate) = gate {
            self.held_copies.fetch_add(1, Ordering::SeqCst);
            // Closing the semaphore is what opens the gate.
            let _ = gate.acquire().await;
        }
        if let Some(pattern) = self.failing_copies.lock().await.as_deref() {
            if source_key.contains(pattern) {
                bail!("injected copy failure for {source_key}");
            }
        }
        let mut guard = self.objects.lock().await;
        let source = guard
            .get(source_key)
            .cloned()
            .ok_or_else(|| anyhow!("object {source_key} missing"))?;
        guard.insert(
            target_key.to_string(),
            StoredObject {
                key: target_key.to_string(),
                ..source
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }
}

#[allow(dead_code)]
impl FakeStorage {
    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        let guard = self.objects.lock().await;
        guard.get(key).cloned()
    }

    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        let guard = self.objects.lock().await;
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn fail_copies_of(&self, pattern: &str) {
        *self.failing_copies.lock().await = Some(pattern.to_string());
    }

    pub async fn hold_copies(&self) {
        self.held_copies.store(0, Ordering::SeqCst);
        *self.copy_gate.lock().await = Some(Arc::new(Semaphore::new(0)));
    }

    pub async fn wait_for_held_copies(&self, expected: usize) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.held_copies.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| {
            anyhow!(
                "only {} of {expected} copies reached storage",
                self.held_copies.load(Ordering::SeqCst)
            )
        })
    }

    pub async fn release_copies(&self) {
        if let Some(gate) = self.copy_gate.lock().await.take() {
            gate.close();
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCounts {
    pub machines: i64,
    pub issues: i64,
    pub solutions: i64,
    pub guides: i64,
    pub steps: i64,
    pub files: i64,
    pub copy_markers: i64,
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct SeededTemplate {
    pub machine_id: Uuid,
    pub issue_ids: Vec<Uuid>,
    pub solution_ids: Vec<Uuid>,
    pub guide_id: Uuid,
    pub step_ids: Vec<Uuid>,
    pub file_keys: Vec<String>,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: 8,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            refresh_token_expiry_days: 30,
            refresh_cookie_secure: false,
            refresh_cookie_domain: None,
            cors_allowed_origin: None,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: "test-bucket".to_string(),
            file_url_expiry_seconds: 60,
            max_upload_bytes: 1024 * 1024,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool.clone(), config, storage_for_state, jwt);
        let router = routes::create_router(state.clone());

        Ok(Self {
            state,
            router,
            storage,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        self.with_conn(truncate_all).await
    }

    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub async fn insert_user(&self, username: &str, password: &str, role: &str) -> Result<Uuid> {
        let username = username.to_string();
        let password = password.to_string();
        let role = role.to_string();
        self.with_conn(move |conn| {
            let password_hash = hash_password(&password)?;
            let user = NewUser {
                id: Uuid::new_v4(),
                email: format!("{username}@example.com"),
                username,
                password_hash,
                role,
                account_type: "FREE".to_string(),
            };
            diesel::insert_into(users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(user.id)
        })
        .await
    }

    pub async fn user_with_token(&self, username: &str, role: &str) -> Result<(Uuid, String)> {
        let password = "correct-horse-battery";
        let user_id = self.insert_user(username, password, role).await?;
        let token = self.login_token(username, password).await?;
        Ok((user_id, token))
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = read_json(response).await?;
        Ok(parsed.access_token)
    }

    pub async fn insert_machine(&self, owner_id: Uuid, name: &str, is_template: bool) -> Result<Uuid> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let machine = NewMachine {
                id: Uuid::new_v4(),
                name,
                model: "VF-2".to_string(),
                series: Some("VF".to_string()),
                description: Some("Vertical machining center".to_string()),
                category: Some("CNC".to_string()),
                manufacturer: Some("Haas".to_string()),
                department: None,
                machine_type: Some("mill".to_string()),
                owner_id,
                is_public: false,
                is_template,
            };
            diesel::insert_into(machines::table)
                .values(&machine)
                .execute(conn)
                .context("failed to insert machine")?;
            Ok(machine.id)
        })
        .await
    }

    pub async fn insert_issue(
        &self,
        machine_id: Uuid,
        title: &str,
        description: &str,
        keywords: &str,
    ) -> Result<Uuid> {
        let issue = NewIssue {
            id: Uuid::new_v4(),
            machine_id,
            title: title.to_string(),
            description: description.to_string(),
            error_code: None,
            keywords: keywords.to_string(),
            created_by: None,
            created_at: None,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(issues::table)
                .values(&issue)
                .execute(conn)
                .context("failed to insert issue")?;
            Ok(issue.id)
        })
        .await
    }

    pub async fn insert_solution(&self, issue_id: Uuid, description: &str) -> Result<Uuid> {
        let solution = NewSolution {
            id: Uuid::new_v4(),
            issue_id,
            description: description.to_string(),
            created_by: None,
            created_at: None,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(solutions::table)
                .values(&solution)
                .execute(conn)
                .context("failed to insert solution")?;
            Ok(solution.id)
        })
        .await
    }

    pub async fn insert_guide(
        &self,
        solution_id: Uuid,
        title: &str,
        step_numbers: &[i32],
    ) -> Result<(Uuid, Vec<Uuid>)> {
        let guide = NewGuide {
            id: Uuid::new_v4(),
            solution_id,
            title: title.to_string(),
            created_by: None,
        };
        let new_steps: Vec<NewStep> = step_numbers
            .iter()
            .map(|number| NewStep {
                id: Uuid::new_v4(),
                guide_id: guide.id,
                step_number: *number,
                description: format!("Step {number}"),
                video_urls: vec![format!("https://videos.example.com/step-{number}")],
            })
            .collect();
        let step_ids = new_steps.iter().map(|step| step.id).collect();
        self.with_conn(move |conn| {
            diesel::insert_into(guides::table)
                .values(&guide)
                .execute(conn)
                .context("failed to insert guide")?;
            if !new_steps.is_empty() {
                diesel::insert_into(steps::table)
                    .values(&new_steps)
                    .execute(conn)
                    .context("failed to insert steps")?;
            }
            Ok(guide.id)
        })
        .await
        .map(|guide_id| (guide_id, step_ids))
    }

    pub async fn insert_file(
        &self,
        entity: EntityRef,
        file_kind: FileKind,
        original_name: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4();
        let key = object_key(entity, id);
        let bytes = format!("contents of {original_name}").into_bytes();
        self.storage
            .put_object(&key, bytes.clone(), None, None)
            .await?;

        let record = NewManagedFile {
            id,
            entity_kind: entity.kind,
            entity_id: entity.id,
            file_kind,
            s3_key: key.clone(),
            original_name: original_name.to_string(),
            content_type: None,
            size_bytes: bytes.len() as i64,
            checksum: "0".repeat(64),
            uploaded_at: None,
        };
        self.with_conn(move |conn| {
            diesel::insert_into(managed_files::table)
                .values(&record)
                .execute(conn)
                .context("failed to insert managed file")?;
            Ok(())
        })
        .await?;
        Ok(key)
    }

    pub async fn seed_template(&self, owner_id: Uuid) -> Result<SeededTemplate> {
        let machine_id = self.insert_machine(owner_id, "Haas VF-2", true).await?;
        let first = self
            .insert_issue(machine_id, "Spindle overheating", "Spindle runs hot", "spindle heat")
            .await?;
        let second = self
            .insert_issue(machine_id, "Coolant leak", "Coolant on the floor", "coolant pump")
            .await?;
        let solution_id = self
            .insert_solution(first, "Replace the spindle fan")
            .await?;
        let (guide_id, step_ids) = self
            .insert_guide(solution_id, "Fan replacement", &[1, 2, 3])
            .await?;

        let file_keys = vec![
            self.insert_file(EntityRef::machine(machine_id), FileKind::Image, "front.png")
                .await?,
            self.insert_file(EntityRef::machine(machine_id), FileKind::Manual, "vf2.pdf")
                .await?,
            self.insert_file(EntityRef::issue(first), FileKind::Image, "spindle.jpg")
                .await?,
            self.insert_file(EntityRef::step(step_ids[1]), FileKind::Image, "fan.jpg")
                .await?,
        ];

        Ok(SeededTemplate {
            machine_id,
            issue_ids: vec![first, second],
            solution_ids: vec![solution_id],
            guide_id,
            step_ids,
            file_keys,
        })
    }

    pub async fn table_counts(&self) -> Result<TableCounts> {
        self.with_conn(|conn| {
            Ok(TableCounts {
                machines: machines::table.count().get_result(conn)?,
                issues: issues::table.count().get_result(conn)?,
                solutions: solutions::table.count().get_result(conn)?,
                guides: guides::table.count().get_result(conn)?,
                steps: steps::table.count().get_result(conn)?,
                files: managed_files::table.count().get_result(conn)?,
                copy_markers: machine_copies::table.count().get_result(conn)?,
            })
        })
        .await
    }

    pub async fn all_file_keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            Ok(managed_files::table
                .select(managed_files::s3_key)
                .order(managed_files::s3_key.asc())
                .load(conn)?)
        })
        .await
    }

    pub async fn files_of(&self, kind: EntityKind, entity_id: Uuid) -> Result<Vec<String>> {
        self.with_conn(move |conn| {
            Ok(managed_files::table
                .filter(managed_files::entity_kind.eq(kind))
                .filter(managed_files::entity_id.eq(entity_id))
                .select(managed_files::s3_key)
                .order(managed_files::s3_key.asc())
                .load(conn)?)
        })
        .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PUT, path, payload, token).await
    }

    pub async fn post_empty(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::POST, path, token).await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::GET, path, token).await
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        self.send_empty(Method::DELETE, path, token).await
    }

    pub async fn upload_file(
        &self,
        path: &str,
        field: &str,
        filename: &str,
        content_type: &str,
        data: &[u8],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
        body.extend(data);
        body.extend(b"\r\n");
        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body))?;
        self.send(request).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body))?).await
    }

    async fn send_empty(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty())?).await
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::Response<Body>> {
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).with_context(|| {
        format!(
            "unexpected response body: {}",
            String::from_utf8_lossy(&body)
        )
    })
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE activity_logs, managed_files, steps, guides, solutions, issues, \
         hidden_templates, machine_copies, machines, refresh_tokens, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}

fn hash_password(password: &str) -> Result<String> {
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::Argon2;

    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?
        .to_string())
}
