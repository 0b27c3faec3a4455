//! HTTP wiring for the authorization server.
//!
//! This module is organized into submodules:
//! - `admin` - Policy, key and revocation administration (/api/admin/*)
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration

pub mod admin;
pub mod health;
pub mod openapi;

pub use health::MISC_TAG;

use crate::AppResources;
use crate::oauth2::{self, OAuth2State};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(oauth_state, app_resources, shutdown))]
pub async fn start_webserver(
    oauth_state: OAuth2State,
    app_resources: AppResources,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> color_eyre::Result<()> {
    let listen_addr = app_resources.config.listen_addr.clone();

    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .merge(oauth2::router(oauth_state.clone()))
        .merge(oauth2::consent::router().with_state(oauth_state.clone()))
        .merge(oauth2::login::router().with_state(oauth_state.clone()))
        .nest("/api/admin", admin::router(oauth_state))
        .routes(routes!(health::health))
        .layer(axum::Extension(app_resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    let router = router.merge(Redoc::with_url("/api-docs", api));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "server listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
