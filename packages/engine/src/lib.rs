//! Multi-tenant automation backend: a subprocess session pool, a
//! distributed scheduler, and a pluggable trigger engine, fronted by a
//! small HTTP surface. See `DESIGN.md` at the workspace root for the
//! module-by-module grounding notes.

pub mod assistant;
pub mod config;
pub mod errors;
pub mod http;
pub mod lock;
pub mod message_processor;
pub mod schedule_parser;
pub mod scheduler;
pub mod session_pool;
pub mod store;
pub mod template;
pub mod transport;
pub mod trigger_engine;
pub mod vault;
