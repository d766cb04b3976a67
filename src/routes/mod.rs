use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod activity;
pub mod auth;
pub mod files;
pub mod health;
pub mod issues;
pub mod machines;
pub mod profile;
pub mod solutions;
pub mod steps;

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

fn cors_layer(allowed: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        tracing::warn!(origin = value, "ignoring invalid CORS allowed origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let machines_routes = Router::new()
        .route(
            "/",
            get(machines::list_machines).post(machines::create_machine),
        )
        .route(
            "/:id",
            get(machines::get_machine)
                .patch(machines::update_machine)
                .delete(machines::delete_machine),
        )
        .route("/:id/copy_template", post(machines::copy_template))
        .route(
            "/:id/issues",
            get(issues::list_issues).post(issues::create_issue),
        )
        .route(
            "/:id/images",
            get(machines::list_images).post(machines::upload_image),
        )
        .route("/:id/images/:file_id", delete(machines::delete_image))
        .route(
            "/:id/manual",
            get(machines::get_manual)
                .post(machines::upload_manual)
                .delete(machines::delete_manual),
        );

    let issues_routes = Router::new()
        .route("/match", post(issues::match_issues))
        .route(
            "/:id",
            get(issues::get_issue)
                .patch(issues::update_issue)
                .delete(issues::delete_issue),
        )
        .route(
            "/:id/solutions",
            get(solutions::list_solutions).post(solutions::create_solution),
        )
        .route(
            "/:id/images",
            get(issues::list_images).post(issues::upload_image),
        )
        .route("/:id/images/:file_id", delete(issues::delete_image));

    let solutions_routes = Router::new()
        .route(
            "/:id",
            patch(solutions::update_solution).delete(solutions::delete_solution),
        )
        .route("/:id/guide", post(solutions::create_guide));

    let guides_routes = Router::new()
        .route(
            "/:id",
            patch(solutions::update_guide).delete(solutions::delete_guide),
        )
        .route("/:id/steps", post(steps::create_step));

    let steps_routes = Router::new()
        .route(
            "/:id",
            patch(steps::update_step).delete(steps::delete_step),
        )
        .route(
            "/:id/images",
            get(steps::list_images).post(steps::upload_image),
        )
        .route("/:id/images/:file_id", delete(steps::delete_image));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/machines", machines_routes)
        .nest("/api/issues", issues_routes)
        .nest("/api/solutions", solutions_routes)
        .nest("/api/guides", guides_routes)
        .nest("/api/steps", steps_routes)
        .route("/api/files/:id", get(files::get_file))
        .route("/api/activity", get(activity::list_activity))
        .route(
            "/api/user/profile",
            get(profile::get_profile)
                .put(profile::update_profile)
                .patch(profile::update_profile),
        )
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
