use std::net::IpAddr;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use codec::control::{AgentRecord, AgentStatus, Metadata};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

/// `online` records decay to `idle` after this much silence.
pub const IDLE_AFTER_MS: u64 = 2 * 60 * 1000;
/// `idle` records decay to `offline` after this much silence.
pub const OFFLINE_AFTER_MS: u64 = 5 * 60 * 1000;

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 500;

/// Filters of a `discover` query; all present filters are AND-ed, the
/// capability filter is any-of.
#[derive(Debug, Default, Clone)]
pub struct DiscoverQuery {
    pub exclude_id: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub status: Option<AgentStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// One page of query results, with the clamped pagination actually used.
#[derive(Debug, Clone)]
pub struct Page {
    pub agents: Vec<AgentRecord>,
    pub limit: usize,
    pub offset: usize,
}

/// Directory counts reported by `stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryStats {
    pub total: usize,
    pub online: usize,
    pub idle: usize,
    pub offline: usize,
}

/// The authoritative agent directory.
///
/// All mutation goes through explicit unix-millisecond timestamps so the
/// decay ladder can be driven synthetically in tests; the hub feeds it
/// wall-clock time. `last_seen` never moves backwards.
pub struct Registry {
    agents: RwLock<HashMap<String, AgentRecord>>,
    // Every id ever handed out. Ids are never reused for the lifetime of
    // the registry, even after the record is gone.
    minted: Mutex<HashSet<String>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            agents: RwLock::new(HashMap::with_capacity(capacity)),
            minted: Mutex::new(HashSet::with_capacity(capacity)),
        }
    }

    /// Mint a fresh 32-hex id (128 random bits).
    fn mint_id(&self) -> String {
        let mut minted = self.minted.lock();

        loop {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);

            let id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            if minted.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Insert a new record with a fresh id, `status = online` and both
    /// timestamps set to `now`.
    pub fn register(
        &self,
        address: String,
        capabilities: Vec<String>,
        metadata: Metadata,
        now: u64,
    ) -> AgentRecord {
        let mut deduped: Vec<String> = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            if !deduped.contains(&capability) {
                deduped.push(capability);
            }
        }

        let record = AgentRecord {
            id: self.mint_id(),
            address,
            capabilities: deduped,
            metadata,
            status: AgentStatus::Online,
            last_seen: now,
            created_at: now,
        };

        self.agents
            .write()
            .insert(record.id.clone(), record.clone());
        record
    }

    /// Refresh `last_seen` and force the record back to `online`.
    pub fn heartbeat(&self, id: &str, now: u64) -> Option<u64> {
        let mut agents = self.agents.write();
        let record = agents.get_mut(id)?;

        record.status = AgentStatus::Online;
        record.last_seen = record.last_seen.max(now);
        Some(record.last_seen)
    }

    /// Refresh `last_seen` without touching the status. Any control
    /// message from an agent counts as activity.
    pub fn touch(&self, id: &str, now: u64) {
        if let Some(record) = self.agents.write().get_mut(id) {
            record.last_seen = record.last_seen.max(now);
        }
    }

    pub fn lookup(&self, id: &str) -> Option<AgentRecord> {
        self.agents.read().get(id).cloned()
    }

    /// Evaluate a `discover` query. Offline records are never returned,
    /// even when the caller filters by status explicitly. Results are
    /// ordered `last_seen` ascending, then id for a stable tiebreak.
    pub fn discover(&self, query: &DiscoverQuery) -> Page {
        let (limit, offset) = clamp_page(query.limit, query.offset);

        let mut matched: Vec<AgentRecord> = self
            .agents
            .read()
            .values()
            .filter(|record| record.status != AgentStatus::Offline)
            .filter(|record| Some(&record.id) != query.exclude_id.as_ref())
            .filter(|record| match &query.capabilities {
                Some(wanted) if !wanted.is_empty() => record.has_any_capability(wanted),
                _ => true,
            })
            .filter(|record| match query.status {
                Some(status) => record.status == status,
                None => true,
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| a.last_seen.cmp(&b.last_seen).then(a.id.cmp(&b.id)));

        Page {
            agents: matched.into_iter().skip(offset).take(limit).collect(),
            limit,
            offset,
        }
    }

    /// Evaluate a `find` query: online holders of one capability, ordered
    /// `last_seen` descending.
    pub fn find(&self, capability: &str, limit: Option<usize>, offset: Option<usize>) -> Page {
        let (limit, offset) = clamp_page(limit, offset);

        let mut matched: Vec<AgentRecord> = self
            .agents
            .read()
            .values()
            .filter(|record| record.status == AgentStatus::Online)
            .filter(|record| record.capabilities.iter().any(|c| c == capability))
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));

        Page {
            agents: matched.into_iter().skip(offset).take(limit).collect(),
            limit,
            offset,
        }
    }

    /// Apply a `status` update. Metadata is merged key by key, never
    /// replaced wholesale.
    pub fn update(
        &self,
        id: &str,
        status: Option<AgentStatus>,
        metadata: Option<Metadata>,
        now: u64,
    ) -> bool {
        let mut agents = self.agents.write();
        let Some(record) = agents.get_mut(id) else {
            return false;
        };

        if let Some(status) = status {
            record.status = status;
        }

        if let Some(metadata) = metadata {
            for (key, value) in metadata {
                record.metadata.insert(key, value);
            }
        }

        record.last_seen = record.last_seen.max(now);
        true
    }

    /// Explicit disconnect, or control-socket close: straight to offline.
    pub fn disconnect(&self, id: &str, now: u64) -> bool {
        let mut agents = self.agents.write();
        let Some(record) = agents.get_mut(id) else {
            return false;
        };

        record.status = AgentStatus::Offline;
        record.last_seen = record.last_seen.max(now);
        true
    }

    /// One pass of the decay ladder, returning the transitions applied.
    pub fn sweep(&self, now: u64) -> Vec<(String, AgentStatus)> {
        let mut evicted = Vec::new();
        let mut agents = self.agents.write();

        for record in agents.values_mut() {
            let silent = now.saturating_sub(record.last_seen);

            let next = match record.status {
                AgentStatus::Online if silent >= IDLE_AFTER_MS => AgentStatus::Idle,
                AgentStatus::Idle if silent >= OFFLINE_AFTER_MS => AgentStatus::Offline,
                _ => continue,
            };

            record.status = next;
            evicted.push((record.id.clone(), next));
        }

        evicted
    }

    pub fn stats(&self) -> DirectoryStats {
        let agents = self.agents.read();

        let mut stats = DirectoryStats {
            total: agents.len(),
            online: 0,
            idle: 0,
            offline: 0,
        };

        for record in agents.values() {
            match record.status {
                AgentStatus::Online => stats.online += 1,
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Offline => stats.offline += 1,
            }
        }

        stats
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

fn clamp_page(limit: Option<usize>, offset: Option<usize>) -> (usize, usize) {
    (
        limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT),
        offset.unwrap_or(0),
    )
}

/// Derive the address the directory publishes for an agent.
///
/// The observed remote IP is authoritative; only the port component of
/// the agent-supplied address is trusted. An agent that supplies no
/// usable port is published at the full observed endpoint. With
/// `trust_client` the supplied address is taken verbatim (development
/// mode only).
pub fn derive_address(
    observed_ip: IpAddr,
    observed_port: u16,
    supplied: Option<&str>,
    trust_client: bool,
) -> String {
    if trust_client {
        if let Some(supplied) = supplied {
            if !supplied.is_empty() {
                return supplied.to_string();
            }
        }
    }

    let port = supplied
        .and_then(|addr| addr.rsplit(':').next())
        .and_then(|port| port.parse::<u16>().ok());

    match port {
        Some(port) => format_endpoint(observed_ip, port),
        None => format_endpoint(observed_ip, observed_port),
    }
}

fn format_endpoint(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{}:{}", ip, port),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(n: usize, now: u64) -> Registry {
        let registry = Registry::default();
        for i in 0..n {
            registry.register(
                format!("10.0.0.{}:4000", i),
                vec!["chat".to_string()],
                Metadata::new(),
                now + i as u64,
            );
        }
        registry
    }

    #[test]
    fn register_mints_unique_ids() {
        let registry = Registry::default();
        let a = registry.register("1.1.1.1:1".into(), vec![], Metadata::new(), 0);
        let b = registry.register("1.1.1.1:1".into(), vec![], Metadata::new(), 0);

        assert_eq!(a.id.len(), 32);
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, AgentStatus::Online);
    }

    #[test]
    fn capabilities_keep_insertion_order_without_duplicates() {
        let registry = Registry::default();
        let record = registry.register(
            "1.1.1.1:1".into(),
            vec!["b".into(), "a".into(), "b".into()],
            Metadata::new(),
            0,
        );

        assert_eq!(record.capabilities, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn decay_ladder_and_heartbeat_recovery() {
        let registry = Registry::default();
        let id = registry
            .register("1.1.1.1:1".into(), vec![], Metadata::new(), 0)
            .id;

        // Not silent long enough yet.
        assert!(registry.sweep(IDLE_AFTER_MS - 1).is_empty());

        let evicted = registry.sweep(IDLE_AFTER_MS);
        assert_eq!(evicted, vec![(id.clone(), AgentStatus::Idle)]);

        let evicted = registry.sweep(OFFLINE_AFTER_MS);
        assert_eq!(evicted, vec![(id.clone(), AgentStatus::Offline)]);

        // Offline records only come back through a fresh registration,
        // or a heartbeat against the old id.
        assert!(registry.sweep(OFFLINE_AFTER_MS * 2).is_empty());

        registry.heartbeat(&id, OFFLINE_AFTER_MS * 2);
        assert_eq!(registry.lookup(&id).unwrap().status, AgentStatus::Online);
    }

    #[test]
    fn last_seen_is_monotonic() {
        let registry = Registry::default();
        let id = registry
            .register("1.1.1.1:1".into(), vec![], Metadata::new(), 100)
            .id;

        registry.touch(&id, 50);
        assert_eq!(registry.lookup(&id).unwrap().last_seen, 100);

        registry.heartbeat(&id, 30);
        assert_eq!(registry.lookup(&id).unwrap().last_seen, 100);

        registry.touch(&id, 200);
        assert_eq!(registry.lookup(&id).unwrap().last_seen, 200);
    }

    #[test]
    fn discover_never_returns_offline() {
        let registry = registry_with(3, 0);
        let id = registry.discover(&DiscoverQuery::default()).agents[0]
            .id
            .clone();

        registry.disconnect(&id, 10);

        let page = registry.discover(&DiscoverQuery::default());
        assert_eq!(page.agents.len(), 2);
        assert!(page.agents.iter().all(|a| a.id != id));

        // Even an explicit offline filter yields nothing.
        let page = registry.discover(&DiscoverQuery {
            status: Some(AgentStatus::Offline),
            ..Default::default()
        });
        assert!(page.agents.is_empty());
    }

    #[test]
    fn discover_filters_compose() {
        let registry = Registry::default();
        let a = registry.register(
            "1.1.1.1:1".into(),
            vec!["chat".into()],
            Metadata::new(),
            0,
        );
        let b = registry.register(
            "1.1.1.1:2".into(),
            vec!["monitor".into()],
            Metadata::new(),
            1,
        );

        let page = registry.discover(&DiscoverQuery {
            capabilities: Some(vec!["monitor".into(), "nope".into()]),
            ..Default::default()
        });
        assert_eq!(page.agents.len(), 1);
        assert_eq!(page.agents[0].id, b.id);

        let page = registry.discover(&DiscoverQuery {
            exclude_id: Some(a.id.clone()),
            ..Default::default()
        });
        assert!(page.agents.iter().all(|r| r.id != a.id));
    }

    #[test]
    fn discover_orders_by_last_seen_ascending() {
        let registry = registry_with(3, 100);
        let page = registry.discover(&DiscoverQuery::default());
        let seen: Vec<u64> = page.agents.iter().map(|a| a.last_seen).collect();
        assert_eq!(seen, vec![100, 101, 102]);
    }

    #[test]
    fn find_is_online_only_and_descending() {
        let registry = registry_with(3, 100);
        let idle = registry.find("chat", None, None).agents[0].id.clone();
        registry.update(&idle, Some(AgentStatus::Idle), None, 200);

        let page = registry.find("chat", None, None);
        assert_eq!(page.agents.len(), 2);
        assert!(page.agents[0].last_seen >= page.agents[1].last_seen);
        assert!(page.agents.iter().all(|a| a.id != idle));

        assert!(registry.find("nope", None, None).agents.is_empty());
    }

    #[test]
    fn pagination_partitions_the_result_set() {
        let registry = registry_with(10, 0);

        let mut seen = Vec::new();
        for k in 0.. {
            let page = registry.discover(&DiscoverQuery {
                limit: Some(3),
                offset: Some(k * 3),
                ..Default::default()
            });

            if page.agents.is_empty() {
                break;
            }

            seen.extend(page.agents.into_iter().map(|a| a.id));
        }

        assert_eq!(seen.len(), 10);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn pagination_caps_apply() {
        let registry = Registry::default();
        let page = registry.discover(&DiscoverQuery {
            limit: Some(10_000),
            ..Default::default()
        });

        assert_eq!(page.limit, MAX_LIMIT);

        let page = registry.discover(&DiscoverQuery::default());
        assert_eq!(page.limit, DEFAULT_LIMIT);
    }

    #[test]
    fn metadata_merges_instead_of_replacing() {
        let registry = Registry::default();
        let mut metadata = Metadata::new();
        metadata.insert("a".into(), serde_json::json!(1));

        let id = registry
            .register("1.1.1.1:1".into(), vec![], metadata, 0)
            .id;

        let mut patch = Metadata::new();
        patch.insert("b".into(), serde_json::json!(2));
        registry.update(&id, None, Some(patch), 1);

        let record = registry.lookup(&id).unwrap();
        assert_eq!(record.metadata.get("a").unwrap(), &serde_json::json!(1));
        assert_eq!(record.metadata.get("b").unwrap(), &serde_json::json!(2));
    }

    #[test]
    fn address_policy_prefers_observed_ip() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert_eq!(
            derive_address(ip, 50000, Some("10.0.0.5:4000"), false),
            "203.0.113.9:4000"
        );
        assert_eq!(
            derive_address(ip, 50000, Some("0.0.0.0:4001"), false),
            "203.0.113.9:4001"
        );
        assert_eq!(derive_address(ip, 50000, None, false), "203.0.113.9:50000");
        assert_eq!(
            derive_address(ip, 50000, Some("garbage"), false),
            "203.0.113.9:50000"
        );
        assert_eq!(
            derive_address(ip, 50000, Some("10.0.0.5:4000"), true),
            "10.0.0.5:4000"
        );
    }
}
