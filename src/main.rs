//! TaskSync - headless mirror of a task server.
//!
//! Logs in, loads items and categories, then keeps the mirror in sync with
//! server push events until interrupted. Every applied change is logged.
//!
//! Environment:
//! - `TASKSYNC_API_URL`, `TASKSYNC_HUB_URL`: server endpoints
//! - `TASKSYNC_TOKEN`: existing bearer token, or
//! - `TASKSYNC_EMAIL` / `TASKSYNC_PASSWORD`: credentials to log in with

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tasksync::{ClientConfig, Credential, Credentials, StoreUpdate, TaskSyncClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasksync=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ClientConfig::from_env().context("Invalid configuration")?;
    info!("TaskSync v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   API: {}", config.api_base_url);
    info!("   Hub: {}", config.hub_url);

    let client = TaskSyncClient::new(&config).context("Failed to create client")?;
    client.start_sync();

    authenticate(&client).await?;
    client
        .rehydrate()
        .await
        .context("Failed to load items and categories")?;

    let mut changes = client.store().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => log_change(change.revision, &change.update),
                Err(RecvError::Lagged(skipped)) => warn!("Change log skipped {} updates", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.commands().logout();
    client.shutdown().await;
    Ok(())
}

async fn authenticate(client: &TaskSyncClient) -> Result<()> {
    if let Some(credential) = std::env::var("TASKSYNC_TOKEN").ok().and_then(Credential::new) {
        info!("Using token from environment");
        client.session().acquire(credential);
        return Ok(());
    }

    let email = std::env::var("TASKSYNC_EMAIL").ok();
    let password = std::env::var("TASKSYNC_PASSWORD").ok();
    match (email, password) {
        (Some(email), Some(password)) => {
            client
                .commands()
                .login(&Credentials { email, password })
                .await
                .context("Login failed")?;
            info!("Logged in");
            Ok(())
        }
        _ => bail!("Set TASKSYNC_TOKEN or TASKSYNC_EMAIL and TASKSYNC_PASSWORD"),
    }
}

fn log_change(revision: u64, update: &StoreUpdate) {
    match update {
        StoreUpdate::ItemsLoaded(items) => info!("[{}] {} items loaded", revision, items.len()),
        StoreUpdate::CategoriesLoaded(categories) => {
            info!("[{}] {} categories loaded", revision, categories.len())
        }
        StoreUpdate::ItemUpserted(item) | StoreUpdate::ItemReplaced(item) => info!(
            "[{}] {} item {} '{}' ({})",
            revision,
            update.kind(),
            item.id,
            item.name,
            item.priority
        ),
        StoreUpdate::CategoryUpserted(category) | StoreUpdate::CategoryReplaced(category) => info!(
            "[{}] {} category {} '{}'",
            revision,
            update.kind(),
            category.id,
            category.name
        ),
        other => info!("[{}] {}", revision, other.kind()),
    }
}
