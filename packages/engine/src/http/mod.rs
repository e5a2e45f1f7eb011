//! HTTP surface (C11): the trigger webhook receiver, the admin endpoints,
//! and the scheduled-task/trigger tool API the assistant subprocess calls
//! back into (spec §6). Grounded on the teacher's `domains/newsletter/
//! webhook.rs` router style (`Router::new().route(...).with_state(state)`,
//! plain `StatusCode` returns) and `server/middleware/session_auth.rs` for
//! the bearer-token admin gate, adapted from session lookup to a constant-
//! time key compare.

mod admin;
mod tools;

use std::sync::Arc;

use axum::middleware;
use axum::Router;

use crate::config::Config;
use crate::message_processor::MessageProcessor;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::trigger_engine::adapters::webhook::WebhookState;
use crate::trigger_engine::TriggerEngine;
use crate::vault::Vault;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub processor: Arc<MessageProcessor>,
    pub scheduler: Arc<Scheduler>,
    pub trigger_engine: Arc<TriggerEngine>,
    pub config: Arc<Config>,
    pub vault: Arc<Vault>,
}

pub fn router(state: AppState) -> Router {
    let webhook_state = WebhookState::new(
        state.store.clone(),
        state.trigger_engine.clone(),
        state.vault.clone(),
    );

    let admin_routes = admin::router(state.clone()).route_layer(middleware::from_fn_with_state(
        state.config.clone(),
        admin::require_admin_bearer,
    ));

    Router::new()
        .merge(crate::trigger_engine::adapters::webhook::webhook_router(
            webhook_state,
        ))
        .merge(admin_routes)
        .merge(tools::router(state))
}
