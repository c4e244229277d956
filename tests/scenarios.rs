//! End-to-end scenarios: a real hub and real agents on loopback.

use std::time::Duration;

use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};

use codec::crypto::{Keypair, NONCE_LEN, TAG_LEN};
use m2m_sdk::{Agent, AgentStatus, DiscoverOptions, Error};
use tests::{agent_options, create_hub, free_port, RawChannel};

/// S1: discover a peer through the hub, then deliver a sealed message.
#[tokio::test]
async fn discover_then_send() -> Result<()> {
    let (hub, _) = create_hub().await?;

    let (a, _a_inbox) = Agent::start(agent_options(hub, &[])).await?;
    let (b, mut b_inbox) = Agent::start(agent_options(hub, &["chat"])).await?;
    let b_id = b.id().unwrap();

    let agents = a.discover(DiscoverOptions::default()).await?;
    let found = agents
        .iter()
        .find(|record| record.id == b_id)
        .expect("discover should list agent b");
    assert!(found
        .address
        .ends_with(&format!(":{}", b.local_addr().port())));

    a.send(&b_id, "hello", &json!({"n": 7})).await?;

    let message = timeout(Duration::from_secs(5), b_inbox.recv())
        .await?
        .expect("listener should dispatch the message");

    assert_eq!(message.from, a.id().unwrap());
    assert_eq!(message.message_type, "hello");
    assert_eq!(message.payload, json!({"n": 7}));

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// S2: capability search is exact and online-only.
#[tokio::test]
async fn find_by_capability() -> Result<()> {
    let (hub, _) = create_hub().await?;

    let (a, _) = Agent::start(agent_options(hub, &[])).await?;
    let (b, _) = Agent::start(agent_options(hub, &["chat"])).await?;

    let found = a.find("chat").await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, b.id().unwrap());

    assert!(a.find("nope").await?.is_empty());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// S3: request/response pairing, and the timeout path when the peer
/// never answers.
#[tokio::test]
async fn request_response_and_timeout() -> Result<()> {
    let (hub, _) = create_hub().await?;

    let (a, _) = Agent::start(agent_options(hub, &[])).await?;
    let (b, mut b_inbox) = Agent::start(agent_options(hub, &["math"])).await?;
    // A deaf peer: acks deliveries at the session layer but never
    // replies at the application layer.
    let (deaf, _deaf_inbox) = Agent::start(agent_options(hub, &[])).await?;

    let responder = {
        let b = b.clone();
        tokio::spawn(async move {
            while let Some(message) = b_inbox.recv().await {
                if message.message_type == "sum" {
                    let total: i64 = message.payload["nums"]
                        .as_array()
                        .map(|nums| nums.iter().filter_map(|n| n.as_i64()).sum())
                        .unwrap_or(0);

                    b.respond(
                        &message.from,
                        &message.message_type,
                        &message.correlation_id,
                        &json!({"result": total}),
                    )
                    .await
                    .unwrap();
                }
            }
        })
    };

    let reply = a
        .request(
            &b.id().unwrap(),
            "sum",
            &json!({"nums": [1, 2, 3]}),
            Some(Duration::from_secs(5)),
        )
        .await?;
    assert_eq!(reply, json!({"result": 6}));

    let failure = a
        .request(
            &deaf.id().unwrap(),
            "sum",
            &json!({"nums": [1]}),
            Some(Duration::from_secs(1)),
        )
        .await;
    assert!(matches!(failure, Err(Error::Timeout)));

    responder.abort();
    a.shutdown().await;
    b.shutdown().await;
    deaf.shutdown().await;
    Ok(())
}

/// S4: a dropped control socket takes the record offline immediately and
/// out of discovery; lookup still reports it, and resolution refuses it.
#[tokio::test]
async fn socket_close_goes_offline() -> Result<()> {
    let (hub, _) = create_hub().await?;
    let (a, _) = Agent::start(agent_options(hub, &[])).await?;

    let mut raw = RawChannel::connect(hub).await?;
    let ghost = raw.register("0.0.0.0:4999", &["ghost"]).await?;

    let agents = a.discover(DiscoverOptions::default()).await?;
    assert!(agents.iter().any(|record| record.id == ghost));

    drop(raw);
    sleep(Duration::from_millis(300)).await;

    let agents = a.discover(DiscoverOptions::default()).await?;
    assert!(agents.iter().all(|record| record.id != ghost));

    let record = a.lookup(&ghost).await?;
    assert_eq!(record.status, AgentStatus::Offline);

    // A fresh runtime has no cached address and must refuse the peer.
    let (fresh, _) = Agent::start(agent_options(hub, &[])).await?;
    assert!(matches!(
        fresh.resolve(&ghost).await,
        Err(Error::Offline(_))
    ));

    a.shutdown().await;
    fresh.shutdown().await;
    Ok(())
}

/// S5: a 1 MiB payload survives the session intact, and a single
/// tampered ciphertext byte yields `decryption_failed` with no delivery.
#[tokio::test]
async fn large_payload_and_tamper_rejection() -> Result<()> {
    let (hub, _) = create_hub().await?;

    let (a, _) = Agent::start(agent_options(hub, &[])).await?;
    let (b, mut b_inbox) = Agent::start(agent_options(hub, &[])).await?;

    let blob = "x".repeat(1024 * 1024);
    a.send(&b.id().unwrap(), "bulk", &json!({"blob": blob}))
        .await?;

    let message = timeout(Duration::from_secs(10), b_inbox.recv())
        .await?
        .expect("bulk message should arrive");
    assert_eq!(message.payload["blob"].as_str().unwrap().len(), 1024 * 1024);

    // Hand-drive a session against b's listener and corrupt the sealed
    // token in flight.
    let mut session = RawChannel::connect(b.local_addr()).await?;
    let keypair = Keypair::generate();

    let ack = session
        .request(json!({
            "type": "handshake",
            "key": keypair.public_spki(),
            "from": "f".repeat(32),
        }))
        .await?;
    let session_key = keypair.derive(ack["key"].as_str().unwrap())?;

    let envelope = json!({
        "payload": {"x": 1},
        "correlationId": codec::correlation_id(),
    });
    let token = codec::crypto::seal(&session_key, &serde_json::to_vec(&envelope)?)?;

    let mut raw = BASE64_STANDARD.decode(token)?;
    raw[NONCE_LEN + TAG_LEN] ^= 0x01;
    let tampered = BASE64_STANDARD.encode(raw);

    let fault = session
        .request(json!({
            "type": "message",
            "messageType": "evil",
            "data": tampered,
            "correlationId": codec::correlation_id(),
        }))
        .await?;
    assert_eq!(fault["error"], "decryption_failed");

    // Nothing was delivered upward.
    assert!(timeout(Duration::from_millis(300), b_inbox.recv())
        .await
        .is_err());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

/// S6: broadcast isolates per-peer failures and reports the aggregate.
#[tokio::test]
async fn broadcast_with_unreachable_peer() -> Result<()> {
    let (hub, _) = create_hub().await?;

    let (l1, mut l1_inbox) = Agent::start(agent_options(hub, &["monitor"])).await?;
    let (l3, mut l3_inbox) = Agent::start(agent_options(hub, &["monitor"])).await?;

    // A third monitor that is registered and online but unreachable: its
    // advertised port has nothing listening.
    let dead_port = free_port()?.port();
    let mut raw = RawChannel::connect(hub).await?;
    let l2 = raw
        .register(&format!("0.0.0.0:{}", dead_port), &["monitor"])
        .await?;

    let (caller, _) = Agent::start(agent_options(hub, &[])).await?;
    let report = caller
        .broadcast("alert", &json!({"x": 1}), Some(vec!["monitor".to_string()]))
        .await?;

    assert_eq!(report.total, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].agent, l2);

    for inbox in [&mut l1_inbox, &mut l3_inbox] {
        let message = timeout(Duration::from_secs(5), inbox.recv())
            .await?
            .expect("broadcast should reach the live listeners");
        assert_eq!(message.message_type, "alert");
        assert_eq!(message.payload, json!({"x": 1}));
    }

    l1.shutdown().await;
    l3.shutdown().await;
    caller.shutdown().await;
    Ok(())
}

/// The informational http surface answers beside the control socket.
#[tokio::test]
async fn http_surface() -> Result<()> {
    let (hub, api) = create_hub().await?;
    let (agent, _) = Agent::start(agent_options(hub, &["chat"])).await?;

    let health = http_get(api, "/health").await?;
    assert!(health.contains("\"status\":\"ok\""));

    let agents = http_get(api, "/agents?capability=chat").await?;
    assert!(agents.contains(&agent.id().unwrap()));

    let stats = http_get(api, "/stats").await?;
    assert!(stats.contains("\"online\":1"));

    agent.shutdown().await;
    Ok(())
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                path
            )
            .as_bytes(),
        )
        .await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;

    let text = String::from_utf8_lossy(&body).into_owned();
    anyhow::ensure!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
    Ok(text)
}
