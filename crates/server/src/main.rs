use rust_oidc_provider::AppResources;
use rust_oidc_provider::api::start_webserver;
use rust_oidc_provider::config::load_config_or_panic;
use rust_oidc_provider::oauth2::{OAuth2State, maintenance};
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use std::time::Duration;
use time::Duration as TimeDuration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "rust_oidc_provider=info,tower_http=info,sea_orm=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let layer = fmt::layer().with_target(true).with_level(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
}

/// Key-rotation scheduler. Rotation is keyed off the active key's age, so
/// running this loop on every instance converges on a single rotation per
/// interval.
fn spawn_rotation_scheduler(state: OAuth2State, mut shutdown: watch::Receiver<bool>) {
    let check = Duration::from_secs(state.config.rotation.check_secs);
    let rotation_interval = TimeDuration::seconds(state.config.rotation.interval_secs);
    tokio::spawn(async move {
        let mut ticker = interval(check);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("rotation scheduler shutting down");
                    return;
                }
            }
            match state.keyring.rotate_if_due(rotation_interval).await {
                Ok(Some(kid)) => tracing::info!(kid = %kid, "scheduled key rotation completed"),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "scheduled key rotation failed"),
            }
        }
    });
}

/// Retention sweep for spent authorization codes and long-dead tokens.
fn spawn_retention_sweep(state: OAuth2State, mut shutdown: watch::Receiver<bool>) {
    let every = Duration::from_secs(state.config.cleanup_interval_secs);
    let retention = TimeDuration::days(state.config.retention_days);
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    tracing::debug!("retention sweep shutting down");
                    return;
                }
            }
            if let Err(e) = maintenance::purge_expired(state.db.as_ref(), retention).await {
                tracing::error!(error = %e, "retention sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    let _ = dotenvy::dotenv();
    initialize_tracing();

    let config = Arc::new(load_config_or_panic());

    let mut connect_options = ConnectOptions::new(&config.database_url);
    connect_options
        .connect_timeout(Duration::from_secs(config.db_connect_timeout_secs))
        .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs));
    let db = Arc::new(
        Database::connect(connect_options)
            .await
            .expect("Failed to connect to database"),
    );

    let resources = AppResources {
        db: db.clone(),
        config: config.clone(),
    };
    let oauth_state = OAuth2State::new(db, config.clone());

    // Bootstrap: a signer and a policy row must exist before the first
    // token request. Both calls are no-ops on an already-initialized store.
    oauth_state.keyring.ensure_initialized().await?;
    oauth_state
        .policies
        .ensure_seeded(&config.token_ttl_defaults)
        .await?;

    tracing::info!(
        issuer = %config.issuer_url,
        rotation_interval_secs = config.rotation.interval_secs,
        rotation_grace_secs = config.rotation.grace_secs,
        password_grant = config.password_grant_enabled,
        "authorization server configured"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    spawn_rotation_scheduler(oauth_state.clone(), shutdown_rx.clone());
    spawn_retention_sweep(oauth_state.clone(), shutdown_rx.clone());

    let mut webserver_shutdown = shutdown_rx;
    start_webserver(oauth_state, resources, async move {
        let _ = webserver_shutdown.changed().await;
    })
    .await?;
    Ok(())
}
