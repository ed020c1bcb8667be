use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

mod auth;
mod capture;
mod config;
mod db;
mod dispatch;
mod email;
mod error;
mod models;
mod rewriter;
mod routes;
mod security;
mod store;
mod tokens;
mod tracking;

use dispatch::{DispatchSettings, Dispatcher};
use email::{MailTransport, RetryPolicy};
use store::CampaignStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CampaignStore>,
    pub config: config::AppConfig,
    pub tera: tera::Tera,
    pub dispatcher: Dispatcher,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/campaigns/{id}", get(routes::campaign::show))
        .route("/api/campaigns/{id}/send", post(routes::campaign::send))
        .route("/api/campaigns/{id}/cancel", post(routes::campaign::cancel))
        .route(
            "/api/campaigns/{id}/recipients",
            put(routes::campaign::update_recipients),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::admin_token_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route(
            "/track/open/{campaign_id}/{recipient_id}",
            get(routes::tracking::track_open),
        )
        .route(
            "/track/click/{campaign_id}/{recipient_id}",
            get(routes::tracking::track_click),
        )
        .route(
            "/phishing/template/{form_template_id}/{token}",
            get(routes::phishing::landing_page),
        )
        .route(
            "/phishing/capture/{form_template_id}",
            post(routes::phishing::capture_submission),
        )
        .route(
            "/phishing/acknowledge/{submission_id}",
            post(routes::phishing::acknowledge),
        )
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    dotenvy::dotenv().ok();

    let config = config::AppConfig::from_env().expect("Failed to load config");
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create DB pool");

    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let tera = tera::Tera::new("src/templates/**/*.html").expect("Failed to load templates");

    let cipher = security::SubmissionCipher::new(config.submission_encryption_key);
    let store: Arc<dyn CampaignStore> =
        Arc::new(store::postgres::PostgresCampaignStore::new(pool, cipher));

    let mail: Arc<dyn MailTransport> = Arc::new(
        email::SmtpMailTransport::new(
            &config.smtp_host,
            config.smtp_port,
            config.smtp_username.as_deref(),
            config.smtp_password.as_deref(),
            config.smtp_tls,
            config.smtp_from_email.clone(),
            RetryPolicy {
                max_attempts: config.smtp_max_attempts,
                backoff: Duration::from_millis(config.smtp_retry_backoff_ms),
            },
        )
        .expect("Failed to create SMTP mail transport"),
    );

    let dispatcher = Dispatcher::new(
        store.clone(),
        mail,
        DispatchSettings::from_config(&config),
    );

    tokio::spawn(dispatch::campaign_scheduler(
        store.clone(),
        dispatcher.clone(),
        Duration::from_secs(config.campaign_scheduler_interval_secs),
    ));

    let state = AppState {
        store,
        config: config.clone(),
        tera,
        dispatcher,
    };

    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install signal handler");
    tracing::info!("Shutting down...");
}
