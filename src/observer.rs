use codec::control::{AgentRecord, AgentStatus};
use service::ServiceHandler;

use crate::statistics::{Statistics, Stats};

/// Wires directory lifecycle events to the log and the counters.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl ServiceHandler for Observer {
    fn on_register(&self, record: &AgentRecord) {
        log::info!(
            "agent registered: id={}, address={}, capabilities={:?}",
            record.id,
            record.address,
            record.capabilities,
        );

        self.statistics.add(&Stats::Registers(1));
    }

    fn on_heartbeat(&self, id: &str) {
        log::debug!("agent heartbeat: id={}", id);
        self.statistics.add(&Stats::Heartbeats(1));
    }

    fn on_status(&self, id: &str, status: Option<AgentStatus>) {
        log::debug!("agent status update: id={}, status={:?}", id, status);
    }

    fn on_disconnect(&self, id: &str) {
        log::info!("agent disconnected: id={}", id);
    }

    fn on_evict(&self, id: &str, status: AgentStatus) {
        log::info!("agent decayed: id={}, status={}", id, status.as_str());
        self.statistics.add(&Stats::Evictions(1));
    }
}
