//! Messages on the hub control channel.
//!
//! Every request is a JSON object tagged by `action` and carrying a
//! `correlationId`; every reply echoes the id verbatim and reports
//! `status: "ok" | "error"`. Requests are multiplexed: replies may arrive
//! in any order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{frame, Error};

pub type Metadata = serde_json::Map<String, Value>;

pub const ERROR_INVALID_JSON: &str = "invalid_json";
pub const ERROR_UNKNOWN_ACTION: &str = "unknown_action";
pub const ERROR_AGENT_NOT_FOUND: &str = "agent_not_found";

/// Directory lifecycle of an agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Idle,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Offline => "offline",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "offline" => Ok(Self::Offline),
            _ => Err(Error::InvalidJson),
        }
    }
}

/// One entry of the hub directory, in its wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: AgentStatus,
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

impl AgentRecord {
    pub fn has_any_capability(&self, wanted: &[String]) -> bool {
        wanted.iter().any(|c| self.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        metadata: Metadata,
    },
    Heartbeat {
        id: String,
    },
    Discover {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<AgentStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },
    Find {
        capability: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offset: Option<usize>,
    },
    Lookup {
        id: String,
    },
    Status {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<AgentStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    Disconnect {
        id: String,
    },
    Stats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub action: ControlAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
}

/// A control-channel reply. The fixed part is the status triple; every
/// action contributes its own extra fields, kept as a flattened map so
/// the hub can assemble replies and the sdk can pick fields without a
/// response type per action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlReply {
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub body: Metadata,
}

impl ControlReply {
    pub fn ok(correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Ok,
            error: None,
            body: Metadata::new(),
        }
    }

    pub fn error(correlation_id: Option<String>, error: &str) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Error,
            error: Some(error.to_string()),
            body: Metadata::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.body.insert(key.to_string(), value);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Decode the `agents` list of a discover/find reply.
    pub fn agents(&self) -> Result<Vec<AgentRecord>, Error> {
        let Some(value) = self.body.get("agents") else {
            return Ok(Vec::new());
        };

        serde_json::from_value(value.clone()).map_err(|_| Error::InvalidJson)
    }

    /// Decode the `agent` field of a lookup reply.
    pub fn agent(&self) -> Result<AgentRecord, Error> {
        let value = self.body.get("agent").ok_or(Error::InvalidJson)?;
        serde_json::from_value(value.clone()).map_err(|_| Error::InvalidJson)
    }
}

pub fn encode_request(request: &ControlRequest) -> Result<Vec<u8>, Error> {
    frame::encode(request)
}

pub fn encode_reply(reply: &ControlReply) -> Result<Vec<u8>, Error> {
    frame::encode(reply)
}
