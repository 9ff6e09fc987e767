//! Route registration. `health` is mounted unauthenticated; everything
//! else goes through [`crate::middleware::auth_middleware`].

pub mod health;
pub mod key_info;
pub mod messages;
pub mod models;
pub mod usage;

use std::sync::Arc;

use axum::middleware as axum_mw;
use axum::Router;
use relay_storage::KvStore;

use crate::middleware::auth_middleware;
use crate::state::AppState;

pub fn router<S: KvStore + 'static>(state: Arc<AppState<S>>) -> Router {
    let authenticated = Router::new()
        .merge(messages::router())
        .merge(models::router())
        .merge(usage::router())
        .merge(key_info::router())
        .route_layer(axum_mw::from_fn_with_state(Arc::clone(&state), auth_middleware));

    Router::new()
        .merge(health::router())
        .merge(authenticated)
        .with_state(state)
}
