pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod trigger;
pub mod workers;

use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::auth::worker_auth_middleware;
use crate::state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    // Worker-facing routes sit behind bearer-token auth.
    let worker_routes = Router::new()
        .route("/api/workers", get(routes::workers::list))
        .route("/api/workers/register", post(routes::workers::register))
        .route("/api/workers/heartbeat", post(routes::workers::heartbeat))
        .route("/api/workers/unregister", post(routes::workers::unregister))
        .route(
            "/api/workers/{worker_id}/tasks",
            get(routes::workers::assignable_tasks),
        )
        .route("/api/tasks/acquire", post(routes::tasks::acquire))
        .route("/api/tasks/report", post(routes::tasks::report))
        .layer(middleware::from_fn_with_state(
            app_state.auth.clone(),
            worker_auth_middleware,
        ));

    Router::new()
        // Subscriptions
        .route("/api/subscriptions/save", post(routes::subscriptions::save))
        .route(
            "/api/subscriptions/subscribe",
            post(routes::subscriptions::subscribe),
        )
        .route(
            "/api/subscriptions/unsubscribe",
            post(routes::subscriptions::unsubscribe),
        )
        .route(
            "/api/accounts/{account}/subscriptions",
            get(routes::subscriptions::list),
        )
        .route(
            "/api/accounts/{account}/subscriptions/batch",
            post(routes::subscriptions::get_many),
        )
        .route(
            "/api/accounts/{account}/subscriptions/by-signatures",
            post(routes::subscriptions::ids_by_signatures),
        )
        .route(
            "/api/accounts/{account}/subscriptions/{id}",
            get(routes::subscriptions::get_one),
        )
        .route(
            "/api/accounts/{account}/subscriptions/{id}/triggers",
            get(routes::subscriptions::polling_info_for_triggers),
        )
        .route(
            "/api/accounts/{account}/connectors/{connector}/reset",
            post(routes::subscriptions::reset_connector),
        )
        .route("/api/scopes/delete", post(routes::subscriptions::delete_scope))
        // Instance sync
        .route("/api/sync/deployments", post(routes::sync::deployment_event))
        .route(
            "/api/accounts/{account}/sync/details",
            get(routes::sync::list_details),
        )
        .merge(worker_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the control-plane server.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(app_state, listener).await
}

/// Start the control-plane server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(
    app_state: AppState,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("perpetual control plane listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
