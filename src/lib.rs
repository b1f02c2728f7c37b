pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod messages;
pub mod models;
pub mod users;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::TokenKeys;
use crate::config::Config;
use crate::db::DbPool;
use crate::messages::MessageStore;
use crate::users::UserStore;

/// Shared request state. Every field is a cheap handle onto the pool.
#[derive(Clone)]
pub struct AppState {
    pub users: UserStore,
    pub messages: MessageStore,
    pub tokens: TokenKeys,
}

impl AppState {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            users: UserStore::new(pool.clone(), config.bcrypt_work_factor),
            messages: MessageStore::new(pool.clone()),
            tokens: TokenKeys::new(&config.secret_key, config.token_ttl, pool),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/login", post(handlers::login))
        .route("/register", post(handlers::register))
        .route("/logout", post(handlers::logout))
        .route("/users", get(handlers::list_users))
        .route("/users/:username", get(handlers::get_user))
        .route("/users/:username/to", get(handlers::messages_to))
        .route("/users/:username/from", get(handlers::messages_from))
        .route("/messages", post(handlers::send_message))
        .route("/messages/:id", get(handlers::get_message))
        .route("/messages/:id/read", post(handlers::mark_read))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
