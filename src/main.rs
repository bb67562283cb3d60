use std::sync::Arc;

use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use es_core::config::{connect_repository, Settings};
use es_core::domain::post::{
    PostCommandHandler, CREATE_POST_COMMAND, PUBLISH_POST_COMMAND, RENAME_POST_COMMAND,
};
use es_core::event_sourcing::{subscriber, CallContext, Command, CommandDispatcher, Event, EventRepository};
use es_core::metrics::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,es_core=debug"))
        )
        .init();

    tracing::info!("🚀 Starting event store demo");

    // === 1. Load configuration (.env + environment) ===
    let settings = Settings::from_env()?;
    tracing::info!(backend = %settings.backend, table = %settings.table, "Configuration loaded");

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);

    // === 3. Connect and migrate the configured repository ===
    let repository: Arc<dyn EventRepository> = Arc::from(connect_repository(&settings, Some(metrics.clone())).await?);
    repository.migrate().await?;

    // === 4. Subscribe to committed events ===
    repository.add_subscriber(subscriber(|ctx: CallContext, event: Event| async move {
        tracing::info!(
            event_type = %event.event_type,
            entity_id = %event.meta.entity_id,
            sequence_no = event.meta.sequence_no,
            account = ?ctx.account(),
            "📨 Event committed"
        );
        Ok(())
    }));

    // === 5. Route commands to the post handler ===
    let commands = CommandDispatcher::new().with_metrics(metrics.clone());
    Arc::new(PostCommandHandler::new(repository.clone())).subscribe(&commands);

    let post_id = uuid::Uuid::now_v7().simple().to_string();
    let ctx = CallContext::new().with_account("demo-account").with_user("demo-user");

    for command in [
        Command::new(CREATE_POST_COMMAND, &json!({"id": post_id, "title": "First Post", "body": "Hello"}))?,
        Command::new(RENAME_POST_COMMAND, &json!({"id": post_id, "title": "First Post (edited)"}))?,
        Command::new(PUBLISH_POST_COMMAND, &json!({"id": post_id}))?,
    ] {
        let command_type = command.command_type.clone();
        commands.dispatch(&ctx, command).await.into_result()?;
        tracing::info!("✅ {} handled", command_type);
    }

    repository.flush().await?;

    // === 6. Read back and replay ===
    let events = repository.get_by_aggregate(&post_id).await?;
    let post = es_core::domain::post::Post::load(&post_id, &events)?;
    tracing::info!(
        post_id = %post_id,
        title = %post.title,
        published = post.published,
        sequence_no = repository.get_aggregate_sequence_number(&post_id).await?,
        "🔁 Post rebuilt from {} events",
        events.len()
    );

    tracing::info!(
        "📊 Metrics registry holds {} metric families",
        metrics.registry().gather().len()
    );
    tracing::info!("🎉 Demo complete!");

    Ok(())
}
