pub mod registry;

#[cfg(test)]
#[path = "../tests/registry.rs"]
mod registry_tests;

use std::net::SocketAddr;
use std::sync::Arc;

use codec::control::{AgentRecord, AgentStatus, Metadata};

use crate::registry::{DirectoryStats, DiscoverQuery, Page, Registry};

/// Hooks fired by the directory on lifecycle events. All methods have
/// default no-op implementations; the hub wires these to logging and
/// statistics.
pub trait ServiceHandler: Send + Sync {
    #[allow(unused_variables)]
    fn on_register(&self, record: &AgentRecord) {}

    #[allow(unused_variables)]
    fn on_heartbeat(&self, id: &str) {}

    #[allow(unused_variables)]
    fn on_status(&self, id: &str, status: Option<AgentStatus>) {}

    /// Explicit disconnect, or control-socket close.
    #[allow(unused_variables)]
    fn on_disconnect(&self, id: &str) {}

    /// The sweeper demoted a record along the decay ladder.
    #[allow(unused_variables)]
    fn on_evict(&self, id: &str, status: AgentStatus) {}
}

pub struct ServiceOptions<T> {
    /// Pre-allocated directory capacity.
    pub capacity: usize,
    /// Accept agent-supplied addresses verbatim (development mode). The
    /// default policy publishes the observed IP with the supplied port.
    pub trust_client_address: bool,
    pub handler: T,
}

/// The hub-side registry service: the directory plus event fan-out.
#[derive(Clone)]
pub struct Service<T> {
    registry: Arc<Registry>,
    trust_client_address: bool,
    handler: Arc<T>,
}

impl<T> Service<T>
where
    T: ServiceHandler + 'static,
{
    pub fn new(options: ServiceOptions<T>) -> Self {
        Self {
            registry: Arc::new(Registry::with_capacity(options.capacity)),
            trust_client_address: options.trust_client_address,
            handler: Arc::new(options.handler),
        }
    }

    /// Register a new agent. The published address is derived from the
    /// control socket's observed remote endpoint and the agent-supplied
    /// port, per the address trust policy.
    pub fn register(
        &self,
        observed: SocketAddr,
        supplied_address: Option<&str>,
        capabilities: Vec<String>,
        metadata: Metadata,
        now: u64,
    ) -> AgentRecord {
        let address = registry::derive_address(
            observed.ip(),
            observed.port(),
            supplied_address,
            self.trust_client_address,
        );

        let record = self.registry.register(address, capabilities, metadata, now);
        self.handler.on_register(&record);
        record
    }

    pub fn heartbeat(&self, id: &str, now: u64) -> Option<u64> {
        let timestamp = self.registry.heartbeat(id, now)?;
        self.handler.on_heartbeat(id);
        Some(timestamp)
    }

    pub fn touch(&self, id: &str, now: u64) {
        self.registry.touch(id, now);
    }

    pub fn lookup(&self, id: &str) -> Option<AgentRecord> {
        self.registry.lookup(id)
    }

    pub fn discover(&self, query: &DiscoverQuery) -> Page {
        self.registry.discover(query)
    }

    pub fn find(&self, capability: &str, limit: Option<usize>, offset: Option<usize>) -> Page {
        self.registry.find(capability, limit, offset)
    }

    pub fn update(
        &self,
        id: &str,
        status: Option<AgentStatus>,
        metadata: Option<Metadata>,
        now: u64,
    ) -> bool {
        let found = self.registry.update(id, status, metadata, now);
        if found {
            self.handler.on_status(id, status);
        }
        found
    }

    pub fn disconnect(&self, id: &str, now: u64) -> bool {
        let found = self.registry.disconnect(id, now);
        if found {
            self.handler.on_disconnect(id);
        }
        found
    }

    /// One decay pass; the hub drives this on a 30 s interval.
    pub fn sweep(&self, now: u64) -> usize {
        let evicted = self.registry.sweep(now);
        for (id, status) in &evicted {
            self.handler.on_evict(id, *status);
        }

        evicted.len()
    }

    pub fn stats(&self) -> DirectoryStats {
        self.registry.stats()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
