use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ahash::HashMap;
use anyhow::Result;
use codec::{
    control::{self, ControlReply, ControlRequest},
    frame::FrameDecoder,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::{unbounded_channel, UnboundedSender},
    time::interval,
};

use service::{registry::DiscoverQuery, Service};

use crate::{
    config::Config,
    observer::Observer,
    statistics::{Statistics, Stats},
};

/// Cadence of the status-decay sweeper.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// Process-wide map of live control sockets, id → socket writer.
///
/// A soft cache for server-push features: reconstructed on reconnect and
/// never authoritative. The durable record lives in the directory.
#[derive(Default, Clone)]
pub struct Clients(Arc<RwLock<HashMap<String, UnboundedSender<Vec<u8>>>>>);

impl Clients {
    fn insert(&self, id: &str, sender: UnboundedSender<Vec<u8>>) {
        self.0.write().insert(id.to_string(), sender);
    }

    fn remove(&self, id: &str) {
        self.0.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Start the control server: the accept loop plus the sweeper. Both run
/// on their own tasks; this returns once the socket is bound.
pub async fn start(
    config: &Config,
    statistics: &Statistics,
    service: &Service<Observer>,
) -> Result<()> {
    let listener = TcpListener::bind(config.control_addr()).await?;
    let local_addr = listener.local_addr()?;
    let clients = Clients::default();

    {
        let service = service.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);

            loop {
                ticker.tick().await;

                let evicted = service.sweep(now_ms());
                if evicted > 0 {
                    log::debug!("sweeper pass: evicted={}", evicted);
                }
            }
        });
    }

    {
        let service = service.clone();
        let statistics = statistics.clone();
        let clients = clients.clone();

        tokio::spawn(async move {
            while let Ok((socket, addr)) = listener.accept().await {
                log::info!("control socket accept: addr={}", addr);

                tokio::spawn(handle_connection(
                    socket,
                    addr,
                    service.clone(),
                    statistics.clone(),
                    clients.clone(),
                ));
            }

            log::error!("control server close: interface={}", local_addr);
        });
    }

    log::info!("hub control server listening: addr={}", local_addr);
    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    service: Service<Observer>,
    statistics: Statistics,
    clients: Clients,
) {
    let _ = socket.set_nodelay(true);
    let (mut reader, mut writer) = socket.into_split();

    // Replies and future server pushes funnel through one writer task.
    let (writer_tx, mut writer_rx) = unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(line) = writer_rx.recv().await {
            if writer.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::default();
    let mut registered: Option<String> = None;

    'connection: loop {
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        loop {
            let value = match decoder.next() {
                Ok(Some(value)) => value,
                Ok(None) => break,
                Err(codec::Error::InvalidJson) => {
                    statistics.add(&Stats::Errors(1));

                    let notice = ControlReply::error(None, control::ERROR_INVALID_JSON);
                    if let Ok(line) = control::encode_reply(&notice) {
                        let _ = writer_tx.send(line);
                    }

                    continue;
                }
                // An unterminated line past the frame cap is hostile;
                // drop the connection.
                Err(_) => {
                    statistics.add(&Stats::Errors(1));
                    break 'connection;
                }
            };

            statistics.add(&Stats::Requests(1));

            let reply = dispatch(
                value,
                addr,
                &service,
                &statistics,
                &clients,
                &writer_tx,
                &mut registered,
            );

            if !reply.is_ok() {
                statistics.add(&Stats::Errors(1));
            }

            match control::encode_reply(&reply) {
                Ok(line) => {
                    if writer_tx.send(line).is_err() {
                        break 'connection;
                    }
                }
                Err(e) => log::error!("control reply encode failed: {}", e),
            }
        }
    }

    // Socket close is an implicit disconnect: the record goes straight
    // to offline.
    if let Some(id) = registered {
        service.disconnect(&id, now_ms());
        clients.remove(&id);
    }

    log::info!("control socket disconnect: addr={}", addr);
}

fn dispatch(
    value: Value,
    addr: SocketAddr,
    service: &Service<Observer>,
    statistics: &Statistics,
    clients: &Clients,
    writer_tx: &UnboundedSender<Vec<u8>>,
    registered: &mut Option<String>,
) -> ControlReply {
    use codec::control::ControlAction;

    let correlation_id = value
        .get("correlationId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let request: ControlRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(_) => return ControlReply::error(correlation_id, control::ERROR_UNKNOWN_ACTION),
    };

    let now = now_ms();

    // Any control message counts as activity for the agent bound to this
    // socket.
    if let Some(id) = registered.as_deref() {
        service.touch(id, now);
    }

    match request.action {
        ControlAction::Register {
            address,
            capabilities,
            metadata,
        } => {
            let record = service.register(addr, address.as_deref(), capabilities, metadata, now);

            if let Some(previous) = registered.replace(record.id.clone()) {
                clients.remove(&previous);
            }
            clients.insert(&record.id, writer_tx.clone());

            ControlReply::ok(correlation_id)
                .with("id", json!(record.id))
                .with("address", json!(record.address))
        }

        ControlAction::Heartbeat { id } => match service.heartbeat(&id, now) {
            Some(timestamp) => {
                ControlReply::ok(correlation_id).with("timestamp", json!(timestamp))
            }
            None => ControlReply::error(correlation_id, control::ERROR_AGENT_NOT_FOUND),
        },

        ControlAction::Discover {
            id,
            capabilities,
            status,
            limit,
            offset,
        } => {
            statistics.add(&Stats::Queries(1));

            let page = service.discover(&DiscoverQuery {
                exclude_id: id,
                capabilities,
                status,
                limit,
                offset,
            });

            ControlReply::ok(correlation_id)
                .with("count", json!(page.agents.len()))
                .with("limit", json!(page.limit))
                .with("offset", json!(page.offset))
                .with("agents", json!(page.agents))
        }

        ControlAction::Find {
            capability,
            limit,
            offset,
        } => {
            statistics.add(&Stats::Queries(1));

            let page = service.find(&capability, limit, offset);

            ControlReply::ok(correlation_id)
                .with("count", json!(page.agents.len()))
                .with("agents", json!(page.agents))
        }

        ControlAction::Lookup { id } => {
            statistics.add(&Stats::Queries(1));

            match service.lookup(&id) {
                Some(agent) => ControlReply::ok(correlation_id).with("agent", json!(agent)),
                None => ControlReply::error(correlation_id, control::ERROR_AGENT_NOT_FOUND),
            }
        }

        ControlAction::Status {
            id,
            status,
            metadata,
        } => {
            if service.update(&id, status, metadata, now) {
                ControlReply::ok(correlation_id)
            } else {
                ControlReply::error(correlation_id, control::ERROR_AGENT_NOT_FOUND)
            }
        }

        ControlAction::Disconnect { id } => {
            if service.disconnect(&id, now) {
                clients.remove(&id);
                if registered.as_deref() == Some(id.as_str()) {
                    *registered = None;
                }

                ControlReply::ok(correlation_id)
            } else {
                ControlReply::error(correlation_id, control::ERROR_AGENT_NOT_FOUND)
            }
        }

        ControlAction::Stats => {
            let directory = service.stats();
            let counters = statistics.snapshot();

            ControlReply::ok(correlation_id)
                .with(
                    "agents",
                    json!({
                        "total": directory.total,
                        "online": directory.online,
                        "idle": directory.idle,
                        "offline": directory.offline,
                    }),
                )
                .with(
                    "counters",
                    json!({
                        "requests": counters.requests,
                        "errors": counters.errors,
                        "registers": counters.registers,
                        "heartbeats": counters.heartbeats,
                        "queries": counters.queries,
                        "evictions": counters.evictions,
                    }),
                )
                .with("connected", json!(clients.len()))
        }
    }
}
