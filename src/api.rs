use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use codec::control::AgentStatus;
use service::{registry::DiscoverQuery, Service};

use crate::{config::Config, observer::Observer, server, statistics::Statistics};

struct ApiState {
    service: Service<Observer>,
    statistics: Statistics,
    uptime: Instant,
}

#[derive(Deserialize)]
struct AgentsQuery {
    capability: Option<String>,
    status: Option<AgentStatus>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// Start the informational http server.
///
/// Read-only, but it enumerates every agent the directory knows; do not
/// expose it directly to an unsafe environment.
pub async fn start_server(
    config: Arc<Config>,
    service: Service<Observer>,
    statistics: Statistics,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        uptime: Instant::now(),
        service,
        statistics,
    });

    let app = Router::new()
        .route(
            "/",
            get(|| async {
                Json(json!({
                    "name": crate::SOFTWARE,
                    "protocol": {
                        "control": "newline-delimited JSON objects over TCP",
                        "peer": "X25519 handshake, AES-256-GCM sealed messages",
                    },
                    "quickstart": {
                        "register": {"action": "register", "address": "0.0.0.0:4000", "capabilities": [], "correlationId": "<16 hex>"},
                        "discover": {"action": "discover", "correlationId": "<16 hex>"},
                    },
                    "endpoints": ["/health", "/agents", "/stats"],
                }))
            }),
        )
        .route(
            "/health",
            get(|| async {
                Json(json!({
                    "status": "ok",
                    "timestamp": server::now_ms(),
                    "version": env!("CARGO_PKG_VERSION"),
                }))
            }),
        )
        .route(
            "/agents",
            get(
                |Query(query): Query<AgentsQuery>, State(state): State<Arc<ApiState>>| async move {
                    let page = state.service.discover(&DiscoverQuery {
                        exclude_id: None,
                        capabilities: query.capability.map(|c| vec![c]),
                        status: query.status,
                        limit: query.limit,
                        offset: query.offset,
                    });

                    Json(json!({
                        "count": page.agents.len(),
                        "limit": page.limit,
                        "offset": page.offset,
                        "agents": page.agents,
                    }))
                },
            ),
        )
        .route(
            "/stats",
            get(|State(state): State<Arc<ApiState>>| async move {
                let directory = state.service.stats();
                let counters = state.statistics.snapshot();

                Json(json!({
                    "agents": {
                        "total": directory.total,
                        "online": directory.online,
                        "idle": directory.idle,
                        "offline": directory.offline,
                    },
                    "counters": {
                        "requests": counters.requests,
                        "errors": counters.errors,
                        "registers": counters.registers,
                        "heartbeats": counters.heartbeats,
                        "queries": counters.queries,
                        "evictions": counters.evictions,
                    },
                    "uptime": state.uptime.elapsed().as_secs(),
                }))
            }),
        )
        .with_state(state);

    let listener = TcpListener::bind(config.api.listen).await?;
    log::info!("hub api server listening: addr={}", config.api.listen);

    axum::serve(listener, app).await?;
    Ok(())
}
