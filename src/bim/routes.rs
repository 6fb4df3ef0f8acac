use axum::{
    Router,
    routing::{delete, get, patch, post, put},
};

use super::handler;
use crate::handler::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entries", get(handler::list_entries))
        .route("/entries", post(handler::create_entry))
        .route("/entries/:id", get(handler::get_entry))
        .route("/entries/:id", put(handler::update_entry))
        .route("/entries/:id", patch(handler::patch_entry))
        .route("/entries/:id", delete(handler::delete_entry))
        .route("/entries/:id", post(handler::method_override))
}
