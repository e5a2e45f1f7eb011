//! Engine server: wires up the store, session pool, scheduler, and trigger
//! engine (with its event-source adapters) behind the HTTP surface, and runs
//! them all for the lifetime of the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use engine_core::assistant::CliAssistantProcess;
use engine_core::config::Config;
use engine_core::http::{self, AppState};
use engine_core::lock::PgAdvisoryLock;
use engine_core::message_processor::MessageProcessor;
use engine_core::scheduler::Scheduler;
use engine_core::session_pool::SessionPool;
use engine_core::store::{PgStore, Store};
use engine_core::transport::{BaseTransport, SmsTransport};
use engine_core::trigger_engine::adapters::{ConditionPoller, EmailPoller};
use engine_core::trigger_engine::TriggerEngine;
use engine_core::vault::Vault;
use sms_transport::{SmsClient, SmsOptions};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,engine_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let lock = Arc::new(
        PgAdvisoryLock::connect(&config.database_url)
            .await
            .context("failed to open advisory lock connection")?,
    );

    let vault_key = config
        .credentials_encryption_key
        .clone()
        .context("CREDENTIALS_ENCRYPTION_KEY must be set")?;
    let vault = Arc::new(Vault::new(&vault_key).context("invalid CREDENTIALS_ENCRYPTION_KEY")?);

    let transport: Arc<dyn BaseTransport> = Arc::new(SmsTransport::new(SmsClient::new(SmsOptions {
        account_sid: config.twilio_account_sid.clone(),
        auth_token: config.twilio_auth_token.clone(),
        from_number: config.twilio_from_number.clone(),
    })));

    let assistant = Arc::new(CliAssistantProcess::new(
        std::env::var("ASSISTANT_PROGRAM").unwrap_or_else(|_| "assistant-cli".to_string()),
        Vec::new(),
        Duration::from_secs(config.assistant_call_timeout_secs),
    ));
    let session_pool = Arc::new(SessionPool::new(
        assistant,
        Duration::from_secs(config.idle_session_timeout_secs),
        false,
    ));

    let processor = Arc::new(MessageProcessor::new(
        store.clone(),
        session_pool.clone(),
        transport.clone(),
        config.max_message_chars,
    ));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        lock.clone(),
        processor.clone(),
        transport.clone(),
    ));

    let trigger_engine = Arc::new(TriggerEngine::new(
        store.clone(),
        processor.clone(),
        transport.clone(),
    ));

    let condition_poller = Arc::new(ConditionPoller::new(store.clone(), trigger_engine.clone()));
    let email_poller = Arc::new(EmailPoller::new(
        store.clone(),
        trigger_engine.clone(),
        vault.clone(),
    ));

    tokio::spawn(scheduler.clone().run());
    tokio::spawn(session_pool.clone().run_idle_eviction());
    tokio::spawn(condition_poller.run());
    tokio::spawn(email_poller.run());

    let app_state = AppState {
        store: store.clone(),
        processor,
        scheduler,
        trigger_engine,
        config: config.clone(),
        vault,
    };
    let app = http::router(app_state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind HTTP listener")?;
    tracing::info!(%addr, "engine server listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
