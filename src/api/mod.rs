// API module - HTTP endpoints

pub mod cards;
pub mod health;
pub mod middleware;
pub mod state;
pub mod wallet;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Full application router: device protocol, collaborator API and health
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(wallet::router())
        .merge(cards::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
