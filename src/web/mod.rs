use crate::capture::BurstReplay;
use crate::config::parse_socket_addr;
use crate::error::{ConfigError, ProxyError, Result};
use crate::state::AppState;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::Filter;

pub mod api;

/// Binds the admin API. The returned future serves until shutdown is
/// broadcast on the application state.
pub fn bind(state: Arc<AppState>) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let admin = &state.config.admin;
    let addr = parse_socket_addr(&admin.host, admin.port).ok_or_else(|| {
        ConfigError::Parse(format!("Invalid admin address: {}", admin.bind_addr()))
    })?;

    let routes = create_routes(state.clone(), Arc::new(state.replay()));
    let mut shutdown = state.shutdown_tx.subscribe();

    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        })
        .map_err(|e| ProxyError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string()),
        })?;

    tracing::info!(addr = %bound, "Admin API listening");
    Ok((bound, server))
}

pub fn create_routes(
    state: Arc<AppState>,
    replay: Arc<BurstReplay>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_routes = api::routes(state, replay).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET", "POST"])
            .allow_headers(vec!["Content-Type"]),
    );

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "burst-proxy"
        }))
    });

    api_routes.or(health)
}
