//! Shared helpers for the end-to-end scenarios: spin up a real hub on
//! loopback, attach real agents, and drive the control channel raw where
//! a scenario needs wire-level access.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use tokio::{io::AsyncReadExt, io::AsyncWriteExt, net::TcpStream, time::sleep};

use codec::frame::FrameDecoder;
use m2m_hub::config::{Api, Config, Hub, Log};
use m2m_sdk::AgentOptions;

/// Reserve a loopback port by binding and immediately releasing it.
pub fn free_port() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// Start a hub on fresh loopback ports and wait until its control socket
/// accepts connections. Returns the control and http addresses.
pub async fn create_hub() -> Result<(SocketAddr, SocketAddr)> {
    let control = free_port()?;
    let api = free_port()?;

    let config = Config {
        hub: Hub {
            listen: Some(control),
            capacity: 64,
            trust_client_address: false,
        },
        api: Api { listen: api },
        log: Log::default(),
    };

    tokio::spawn(async move {
        m2m_hub::startup(Arc::new(config)).await.unwrap();
    });

    for _ in 0..50 {
        if TcpStream::connect(control).await.is_ok() {
            return Ok((control, api));
        }

        sleep(Duration::from_millis(100)).await;
    }

    bail!("hub did not start listening on {}", control)
}

pub fn agent_options(hub: SocketAddr, capabilities: &[&str]) -> AgentOptions {
    AgentOptions {
        port: 0,
        hub: hub.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        ..Default::default()
    }
}

/// A bare newline-JSON channel, usable against both the control socket
/// and a peer listener, for scenarios that need wire-level access.
pub struct RawChannel {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl RawChannel {
    pub async fn connect(hub: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(hub).await?,
            decoder: FrameDecoder::default(),
        })
    }

    pub async fn send(&mut self, body: Value) -> Result<()> {
        let mut line = serde_json::to_vec(&body)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        Ok(())
    }

    pub async fn request(&mut self, body: Value) -> Result<Value> {
        self.send(body).await?;
        self.read_frame().await
    }

    pub async fn read_frame(&mut self) -> Result<Value> {
        loop {
            if let Some(value) = self.decoder.next().map_err(|e| anyhow!("{e}"))? {
                return Ok(value);
            }

            if self.stream.read_buf(self.decoder.buffer_mut()).await? == 0 {
                bail!("control socket closed");
            }
        }
    }

    /// Register and hand back the minted id, keeping the socket open.
    pub async fn register(&mut self, address: &str, capabilities: &[&str]) -> Result<String> {
        let reply = self
            .request(serde_json::json!({
                "action": "register",
                "correlationId": codec::correlation_id(),
                "address": address,
                "capabilities": capabilities,
            }))
            .await?;

        if reply["status"] != "ok" {
            bail!("register failed: {}", reply);
        }

        reply["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("register reply missing id"))
    }
}
