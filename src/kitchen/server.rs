use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use kds_common::RetentionPolicy;

use super::api::{self, AppState};
use super::db::{DbHandle, KitchenDb, StoreOptions};
use crate::config::KdsConfig;

/// Configuration for the kitchen display server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub retention: RetentionPolicy,
    pub default_feed_limit: u32,
    pub store: StoreOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3170,
            db_path: PathBuf::from(".kds/kds.db"),
            dev_mode: false,
            retention: RetentionPolicy::default(),
            default_feed_limit: 100,
            store: StoreOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &KdsConfig) -> Result<Self> {
        Ok(Self {
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            retention: config.retention.policy()?,
            default_feed_limit: config.feed.default_limit,
            store: config.store.options(),
        })
    }
}

/// Build the full application router: the API plus a JSON 404 for anything else.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().fallback(not_found).with_state(state)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "No such route", "retryable": false})),
    )
}

/// Open the database and run migrations, creating the parent directory.
pub fn open_database(config: &ServerConfig) -> Result<KitchenDb> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    KitchenDb::with_options(&config.db_path, config.store)
        .context("Failed to initialize kitchen database")
}

/// Start the kitchen display server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_database(&config)?;
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        retention: config.retention,
        default_feed_limit: config.default_feed_limit,
    });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, db = %config.db_path.display(), "kitchen display server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C, shutting down");
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let db = KitchenDb::new_in_memory().unwrap();
        let state = Arc::new(AppState {
            db: DbHandle::new(db),
            retention: RetentionPolicy::default(),
            default_feed_limit: 100,
        });
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/categories")
            .header(api::ROLE_HEADER, "manager")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = test_router();
        let req = Request::builder()
            .uri("/some/client/route")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "No such route");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3170);
        assert_eq!(config.db_path, PathBuf::from(".kds/kds.db"));
        assert!(!config.dev_mode);
        assert_eq!(config.default_feed_limit, 100);
        assert_eq!(config.store.max_attempts, 3);
    }

    #[test]
    fn test_server_config_from_file_config() {
        let mut file = KdsConfig::default();
        file.server.port = 9000;
        file.retention.cancelled_minutes = 1;
        let config = ServerConfig::from_config(&file).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.retention.cancelled, chrono::Duration::minutes(1));
    }

    #[test]
    fn test_server_config_rejects_unrepresentable_retention() {
        let mut file = KdsConfig::default();
        file.retention.completed_minutes = i64::MAX;
        let err = ServerConfig::from_config(&file).unwrap_err();
        assert!(format!("{:#}", err).contains("retention"));
    }

    #[test]
    fn test_open_database_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("nested").join("kds.db"),
            ..ServerConfig::default()
        };
        let db = open_database(&config).unwrap();
        assert!(db.list_categories().unwrap().is_empty());
        assert!(config.db_path.exists());
    }
}
