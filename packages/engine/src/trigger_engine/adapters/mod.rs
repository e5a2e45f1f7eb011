//! Event-source adapters (C10): the webhook receiver, the condition poller,
//! and the email poller, each producing `TriggerEvent`s and handing them to
//! `TriggerEngine::handle`. Each adapter is structured like the scheduler's
//! own tick loop (`interval` + guard idiom, see `scheduler/mod.rs`), but
//! owns its own adapter-local edge-detection/dedup state rather than
//! sharing the scheduler's.

pub mod condition_poller;
pub mod email_poller;
pub mod webhook;

pub use condition_poller::ConditionPoller;
pub use email_poller::EmailPoller;
pub use webhook::{webhook_router, WebhookState};
