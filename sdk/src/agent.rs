//! The agent runtime.
//!
//! Composes the listener, the hub client and the pending-request table
//! into one handle: register with the hub, discover peers, send sealed
//! messages, serve request/response traffic and fan out broadcasts. One
//! inbound message channel and one connection-state watch replace the
//! source protocol's untyped event dispatch.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use codec::control::{AgentRecord, AgentStatus, ControlAction, ControlReply, Metadata};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::{interval_at, sleep, Instant},
};

use crate::{
    error::{Error, Result},
    hub::{HubConnection, REQUEST_TIMEOUT as HUB_TIMEOUT},
    listener,
    requests::PendingRequests,
    resolver::AddressCache,
    session::{self, Incoming},
};

/// Fixed delay between reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Default deadline for an application-level request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Reply messages carry the original type with this suffix.
pub const RESPONSE_SUFFIX: &str = ":response";

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// P2P listen port. Zero binds an ephemeral port, which is then
    /// advertised to the hub.
    pub port: u16,
    /// Hub control endpoint, `host:port`.
    pub hub: String,
    /// Explicit public endpoint override. The hub only trusts the port
    /// component unless it runs in trust-client mode.
    pub address: Option<String>,
    pub capabilities: Vec<String>,
    pub metadata: Metadata,
    pub heartbeat_interval: Duration,
    pub auto_reconnect: bool,
    /// Deadline for application-level request/response pairs.
    pub request_timeout: Duration,
    /// Deadline for one hub control request.
    pub hub_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            port: 0,
            hub: "127.0.0.1:8080".to_string(),
            address: None,
            capabilities: Vec::new(),
            metadata: Metadata::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            auto_reconnect: true,
            request_timeout: REQUEST_TIMEOUT,
            hub_timeout: HUB_TIMEOUT,
        }
    }
}

/// Connection-state events observable through [`Agent::state`].
#[derive(Debug, Clone, PartialEq)]
pub enum HubState {
    Connected { id: String, address: String },
    Disconnected,
}

/// Filters for [`Agent::discover`]. All present filters are AND-ed; the
/// capability filter matches any of the requested labels.
#[derive(Debug, Default, Clone)]
pub struct DiscoverOptions {
    pub exclude_self: bool,
    pub capabilities: Option<Vec<String>>,
    pub status: Option<AgentStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Aggregate result of a broadcast. Partial failure is not an error of
/// the broadcast itself.
#[derive(Debug, Clone, Default)]
pub struct BroadcastReport {
    pub total: usize,
    pub delivered: usize,
    pub failed: usize,
    pub errors: Vec<BroadcastFailure>,
}

#[derive(Debug, Clone)]
pub struct BroadcastFailure {
    pub agent: String,
    pub error: String,
}

#[derive(Debug, Clone)]
struct Identity {
    id: String,
    address: String,
}

struct Inner {
    options: AgentOptions,
    local_addr: SocketAddr,
    identity: Mutex<Option<Identity>>,
    hub: Mutex<Option<Arc<HubConnection>>>,
    cache: AddressCache,
    pending: PendingRequests,
    state_tx: watch::Sender<HubState>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<Inner>,
}

impl Agent {
    /// Start the runtime: bind the listener, attach to the hub, register,
    /// and hand back the inbound message channel.
    ///
    /// Returns once the first registration succeeded; reconnects after
    /// that are automatic (fixed 5 s delay) unless `auto_reconnect` is
    /// off. Each reconnect re-registers under a fresh hub-assigned id.
    pub async fn start(options: AgentOptions) -> Result<(Agent, mpsc::Receiver<Incoming>)> {
        if options.hub.is_empty() {
            return Err(Error::Config("hub endpoint is required".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (raw_tx, mut raw_rx) = mpsc::channel::<Incoming>(256);
        let (app_tx, app_rx) = mpsc::channel::<Incoming>(256);

        let local_addr = listener::start(options.port, raw_tx, shutdown_rx).await?;
        let (state_tx, _) = watch::channel(HubState::Disconnected);

        let agent = Agent {
            inner: Arc::new(Inner {
                options,
                local_addr,
                identity: Mutex::new(None),
                hub: Mutex::new(None),
                cache: AddressCache::default(),
                pending: PendingRequests::default(),
                state_tx,
                shutdown_tx,
            }),
        };

        // Route `<type>:response` messages to their waiters; everything
        // else, and any response nobody is waiting for, goes to the
        // application channel.
        {
            let inner = agent.inner.clone();
            tokio::spawn(async move {
                while let Some(message) = raw_rx.recv().await {
                    let unclaimed = if message.message_type.ends_with(RESPONSE_SUFFIX) {
                        let correlation_id = message.correlation_id.clone();
                        inner.pending.complete(&correlation_id, message)
                    } else {
                        Some(message)
                    };

                    if let Some(message) = unclaimed {
                        if app_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }

        // The first attach is synchronous so callers come back
        // registered and discoverable.
        let connection =
            HubConnection::connect(&agent.inner.options.hub, agent.inner.options.hub_timeout)
                .await?;
        agent.attach(connection).await?;

        tokio::spawn(maintain_hub(agent.clone()));

        Ok((agent, app_rx))
    }

    /// The hub-assigned id, once registered. Replaced on re-register.
    pub fn id(&self) -> Option<String> {
        self.inner.identity.lock().as_ref().map(|it| it.id.clone())
    }

    /// The address the hub published for this agent.
    pub fn address(&self) -> Option<String> {
        self.inner
            .identity
            .lock()
            .as_ref()
            .map(|it| it.address.clone())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Subscribe to connection-state changes.
    pub fn state(&self) -> watch::Receiver<HubState> {
        self.inner.state_tx.subscribe()
    }

    fn hub(&self) -> Result<Arc<HubConnection>> {
        self.inner
            .hub
            .lock()
            .clone()
            .ok_or_else(|| Error::Transport("hub not connected".to_string()))
    }

    /// Resolve an agent id to a dialable address: fresh cache entry, or
    /// hub lookup. Offline peers are refused; idle peers may still
    /// answer and are resolved normally.
    pub async fn resolve(&self, id: &str) -> Result<String> {
        if let Some(address) = self.inner.cache.get(id) {
            return Ok(address);
        }

        let reply = self
            .hub()?
            .request(ControlAction::Lookup { id: id.to_string() })
            .await?;

        if !reply.is_ok() {
            return Err(registry_error(&reply, id));
        }

        let agent = reply.agent()?;
        if agent.status == AgentStatus::Offline {
            return Err(Error::Offline(id.to_string()));
        }

        self.inner.cache.insert(id, &agent.address);
        Ok(agent.address)
    }

    /// Send one sealed message over a fresh session and wait for its ack.
    pub async fn send(&self, to: &str, message_type: &str, payload: &Value) -> Result<()> {
        self.send_with_correlation(to, message_type, payload, &codec::correlation_id())
            .await
    }

    async fn send_with_correlation(
        &self,
        to: &str,
        message_type: &str,
        payload: &Value,
        correlation_id: &str,
    ) -> Result<()> {
        let from = self
            .id()
            .ok_or_else(|| Error::Transport("not registered with the hub".to_string()))?;

        let address = self.resolve(to).await?;
        session::dial(&address, &from, message_type, payload, correlation_id).await
    }

    /// Application-level RPC: send a message, await the peer's
    /// `<type>:response` carrying the same correlation id.
    pub async fn request(
        &self,
        to: &str,
        message_type: &str,
        payload: &Value,
        deadline: Option<Duration>,
    ) -> Result<Value> {
        let deadline = deadline.unwrap_or(self.inner.options.request_timeout);
        let correlation_id = codec::correlation_id();

        // Register the waiter before sending; the response may race the
        // ack on a fast peer.
        let waiter = self.inner.pending.register(&correlation_id)?;

        if let Err(e) = self
            .send_with_correlation(to, message_type, payload, &correlation_id)
            .await
        {
            self.inner.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, waiter).await {
            Ok(Ok(incoming)) => Ok(incoming.payload),
            Ok(Err(_)) => Err(Error::Transport("runtime teardown".to_string())),
            Err(_) => {
                self.inner.pending.remove(&correlation_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Answer a request: a fresh outbound session to the requester's
    /// current address, type suffixed with `:response`, original
    /// correlation id.
    pub async fn respond(
        &self,
        to: &str,
        message_type: &str,
        correlation_id: &str,
        payload: &Value,
    ) -> Result<()> {
        let response_type = format!("{}{}", message_type, RESPONSE_SUFFIX);
        self.send_with_correlation(to, &response_type, payload, correlation_id)
            .await
    }

    pub async fn discover(&self, options: DiscoverOptions) -> Result<Vec<AgentRecord>> {
        let exclude = if options.exclude_self { self.id() } else { None };

        let reply = self
            .hub()?
            .request(ControlAction::Discover {
                id: exclude,
                capabilities: options.capabilities,
                status: options.status,
                limit: options.limit,
                offset: options.offset,
            })
            .await?;

        if !reply.is_ok() {
            return Err(Error::Application(reply.error.unwrap_or_default()));
        }

        let agents = reply.agents()?;
        self.inner.cache.absorb(&agents);
        Ok(agents)
    }

    /// Online holders of one capability.
    pub async fn find(&self, capability: &str) -> Result<Vec<AgentRecord>> {
        let reply = self
            .hub()?
            .request(ControlAction::Find {
                capability: capability.to_string(),
                limit: None,
                offset: None,
            })
            .await?;

        if !reply.is_ok() {
            return Err(Error::Application(reply.error.unwrap_or_default()));
        }

        let agents = reply.agents()?;
        self.inner.cache.absorb(&agents);
        Ok(agents)
    }

    pub async fn lookup(&self, id: &str) -> Result<AgentRecord> {
        let reply = self
            .hub()?
            .request(ControlAction::Lookup { id: id.to_string() })
            .await?;

        if !reply.is_ok() {
            return Err(registry_error(&reply, id));
        }

        Ok(reply.agent()?)
    }

    /// Push a status/metadata update; metadata is merged by the hub.
    pub async fn set_status(
        &self,
        status: Option<AgentStatus>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let id = self
            .id()
            .ok_or_else(|| Error::Transport("not registered with the hub".to_string()))?;

        let reply = self
            .hub()?
            .request(ControlAction::Status {
                id: id.clone(),
                status,
                metadata,
            })
            .await?;

        if !reply.is_ok() {
            return Err(registry_error(&reply, &id));
        }

        Ok(())
    }

    /// Aggregate hub counters, as a raw JSON object.
    pub async fn hub_stats(&self) -> Result<Value> {
        let reply = self.hub()?.request(ControlAction::Stats).await?;

        if !reply.is_ok() {
            return Err(Error::Application(reply.error.unwrap_or_default()));
        }

        Ok(Value::Object(reply.body))
    }

    /// Fan one message out to every online peer matching the capability
    /// filter, isolating per-peer failures.
    pub async fn broadcast(
        &self,
        message_type: &str,
        payload: &Value,
        capabilities: Option<Vec<String>>,
    ) -> Result<BroadcastReport> {
        let peers = self
            .discover(DiscoverOptions {
                capabilities,
                status: Some(AgentStatus::Online),
                ..Default::default()
            })
            .await?;

        let mut sends = JoinSet::new();
        for peer in &peers {
            let agent = self.clone();
            let to = peer.id.clone();
            let message_type = message_type.to_string();
            let payload = payload.clone();

            sends.spawn(async move {
                let result = agent.send(&to, &message_type, &payload).await;
                (to, result)
            });
        }

        let mut report = BroadcastReport {
            total: peers.len(),
            ..Default::default()
        };

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.delivered += 1,
                Ok((agent, Err(e))) => {
                    report.failed += 1;
                    report.errors.push(BroadcastFailure {
                        agent,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(BroadcastFailure {
                        agent: String::new(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Tear the runtime down: tell the hub, stop the listener and the
    /// hub task, and fail every pending waiter.
    pub async fn shutdown(&self) {
        let connection = self.inner.hub.lock().clone();
        if let (Some(connection), Some(id)) = (connection, self.id()) {
            let _ = connection.request(ControlAction::Disconnect { id }).await;
        }

        self.inner.shutdown_tx.send_replace(true);
        *self.inner.hub.lock() = None;
        self.inner.pending.fail_all();
        self.inner.state_tx.send_replace(HubState::Disconnected);
    }

    /// Register over a fresh connection and make it the current one.
    async fn attach(&self, connection: Arc<HubConnection>) -> Result<()> {
        let options = &self.inner.options;

        let advertised = options
            .address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.inner.local_addr.port()));

        let reply = connection
            .request(ControlAction::Register {
                address: Some(advertised),
                capabilities: options.capabilities.clone(),
                metadata: options.metadata.clone(),
            })
            .await?;

        if !reply.is_ok() {
            return Err(Error::Application(
                reply.error.unwrap_or_else(|| "register rejected".to_string()),
            ));
        }

        let id = reply
            .field("id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("register reply missing id".to_string()))?
            .to_string();

        let address = reply
            .field("address")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        log::info!("registered with hub: id={}, address={}", id, address);

        *self.inner.identity.lock() = Some(Identity {
            id: id.clone(),
            address: address.clone(),
        });
        *self.inner.hub.lock() = Some(connection);
        self.inner.state_tx.send_replace(HubState::Connected { id, address });

        Ok(())
    }
}

fn registry_error(reply: &ControlReply, id: &str) -> Error {
    match reply.error.as_deref() {
        Some(codec::control::ERROR_AGENT_NOT_FOUND) => Error::NotFound(id.to_string()),
        Some("agent_offline") => Error::Offline(id.to_string()),
        Some(other) => Error::Application(other.to_string()),
        None => Error::Application("hub error".to_string()),
    }
}

/// Heartbeat the current connection and reconnect when it dies. The
/// previous id is not preserved across reconnects; the hub mints a new
/// one at re-register.
async fn maintain_hub(agent: Agent) {
    let mut shutdown = agent.inner.shutdown_tx.subscribe();

    loop {
        let Some(connection) = agent.inner.hub.lock().clone() else {
            return;
        };

        let mut closed = connection.closed();
        let cadence = agent.inner.options.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + cadence, cadence);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(id) = agent.id() {
                        if let Err(e) = connection.request(ControlAction::Heartbeat { id }).await {
                            log::warn!("heartbeat failed: {}", e);
                        }
                    }
                }
                _ = closed.changed() => break,
                _ = shutdown.changed() => return,
            }
        }

        *agent.inner.hub.lock() = None;
        agent.inner.state_tx.send_replace(HubState::Disconnected);
        log::warn!("hub connection lost: endpoint={}", agent.inner.options.hub);

        if !agent.inner.options.auto_reconnect {
            return;
        }

        loop {
            tokio::select! {
                _ = sleep(RECONNECT_DELAY) => {}
                _ = shutdown.changed() => return,
            }

            match HubConnection::connect(&agent.inner.options.hub, agent.inner.options.hub_timeout)
                .await
            {
                Ok(connection) => match agent.attach(connection).await {
                    Ok(()) => break,
                    Err(e) => log::warn!("re-register failed: {}", e),
                },
                Err(e) => log::warn!("hub reconnect failed: {}", e),
            }
        }
    }
}
