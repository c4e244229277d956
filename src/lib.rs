#[cfg(feature = "api")]
pub mod api;

pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, observer::Observer, statistics::Statistics};

use service::{Service, ServiceOptions};

static SOFTWARE: &str = concat!("m2m-hub.", env!("CARGO_PKG_VERSION"));

/// Bring up a complete hub from a resolved configuration: directory,
/// observer, control server, sweeper and (when enabled) the http
/// surface. Public so the end-to-end tests can boot a hub in-process on
/// loopback ports instead of shelling out to the binary.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{} starting", SOFTWARE);

    let statistics = Statistics::default();
    let service = Service::new(ServiceOptions {
        capacity: config.hub.capacity,
        trust_client_address: config.hub.trust_client_address,
        handler: Observer::new(statistics.clone()),
    });

    server::start(&config, &statistics, &service).await?;

    #[cfg(feature = "api")]
    {
        api::start_server(config, service, statistics).await?;
    }

    // Everything above runs on spawned tasks. With the api compiled out
    // nothing blocks this future, so park it; returning would let main
    // exit under the agents' feet.
    #[cfg(not(feature = "api"))]
    {
        std::future::pending::<()>().await;
    }

    Ok(())
}
