use std::net::SocketAddr;

use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};

use crate::{
    error::Result,
    session::{self, Incoming},
};

/// Start the inbound listener: one responder session per accepted
/// connection, decrypted messages dispatched into `incoming`. Returns the
/// bound address so an ephemeral port can be advertised to the hub.
pub async fn start(
    port: u16,
    incoming: mpsc::Sender<Incoming>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;

    log::info!("agent listener started: addr={}", local_addr);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else {
                        break;
                    };

                    log::debug!("peer session accept: addr={}", addr);
                    tokio::spawn(session::serve(stream, incoming.clone()));
                }
                _ = shutdown.changed() => break,
            }
        }

        log::debug!("agent listener stopped: addr={}", local_addr);
    });

    Ok(local_addr)
}
