use std::time::{Duration, Instant};

use ahash::{HashMap, HashMapExt};
use codec::control::AgentRecord;
use parking_lot::Mutex;

/// How long a cached address stays valid.
pub const ADDRESS_TTL: Duration = Duration::from_secs(60);

/// Agent-id → address cache. Expired or missing entries force a hub
/// lookup; discover and find results are absorbed as a side effect.
pub struct AddressCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::with_ttl(ADDRESS_TTL)
    }
}

impl AddressCache {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(64)),
            ttl,
        }
    }

    /// A fresh address, if one is cached.
    pub fn get(&self, id: &str) -> Option<String> {
        let mut entries = self.entries.lock();

        match entries.get(id) {
            Some((address, inserted)) if inserted.elapsed() < self.ttl => Some(address.clone()),
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, id: &str, address: &str) {
        self.entries
            .lock()
            .insert(id.to_string(), (address.to_string(), Instant::now()));
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Absorb directory query results.
    pub fn absorb(&self, records: &[AgentRecord]) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        for record in records {
            entries.insert(record.id.clone(), (record.address.clone(), now));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
