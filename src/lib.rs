//! Chest X-ray diagnosis service: an image classification pipeline behind an
//! axum HTTP surface, with user accounts, per-user prediction history and
//! notifications.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod disease_info;
pub mod error;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod routes;
pub mod store;
pub mod utils;

use auth::TokenKeys;
use disease_info::DiseaseInfo;
use pipeline::Classifier;
use store::Store;

/// Shared by every request.
pub struct AppState {
    pub classifier: Classifier,
    pub store: Store,
    pub disease_info: Arc<dyn DiseaseInfo>,
    pub tokens: TokenKeys,
}

pub fn construct_router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(routes::health_check))
        .route("/api/auth/register", post(routes::register_handler))
        .route("/api/auth/login", post(routes::login_handler))
        .route("/api/auth/refresh", post(routes::refresh_handler))
        .route("/api/profile", put(routes::profile_handler))
        .route("/api/predict", post(routes::predict_handler))
        .route("/api/history", get(routes::history_handler))
        .route("/api/notifications", get(routes::notifications_handler))
        .route("/api/diseases/:name", get(routes::disease_handler))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
