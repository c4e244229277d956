//! # m2m agent runtime
//!
//! Client side of the m2m fabric: register with a hub, discover peers by
//! capability, and exchange end-to-end-encrypted messages over direct
//! TCP sessions. The hub never sees payloads; every session runs its own
//! X25519 agreement and AES-256-GCM sealing.
//!
//! ```no_run
//! use m2m_sdk::{Agent, AgentOptions};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), m2m_sdk::Error> {
//! let (agent, mut incoming) = Agent::start(AgentOptions {
//!     port: 4000,
//!     hub: "127.0.0.1:8080".to_string(),
//!     capabilities: vec!["chat".to_string()],
//!     ..Default::default()
//! })
//! .await?;
//!
//! // Fire-and-forget send to a discovered peer.
//! for peer in agent.find("chat").await? {
//!     agent.send(&peer.id, "hello", &json!({"n": 7})).await?;
//! }
//!
//! // Serve inbound traffic.
//! while let Some(message) = incoming.recv().await {
//!     if message.message_type == "sum" {
//!         agent
//!             .respond(
//!                 &message.from,
//!                 &message.message_type,
//!                 &message.correlation_id,
//!                 &json!({"result": 6}),
//!             )
//!             .await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod error;
pub mod hub;
pub mod listener;
pub mod requests;
pub mod resolver;
pub mod session;

pub use agent::{
    Agent, AgentOptions, BroadcastFailure, BroadcastReport, DiscoverOptions, HubState,
};
pub use codec::control::{AgentRecord, AgentStatus, Metadata};
pub use error::{Error, Result};
pub use session::Incoming;
