use std::time::Duration;

use m2m_sdk::{Agent, AgentOptions};
use serde_json::json;

/// A tiny echo pair against a local hub: run `m2m-hub --port 8080`, then
/// this example. It starts a responder agent and a caller agent in one
/// process and routes a request between them through the fabric.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (echo, mut inbox) = Agent::start(AgentOptions {
        hub: "127.0.0.1:8080".to_string(),
        capabilities: vec!["echo".to_string()],
        ..Default::default()
    })
    .await?;

    println!("echo agent registered: id={}", echo.id().unwrap());

    let responder = echo.clone();
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            println!(
                "echo agent received: type={}, from={}",
                message.message_type, message.from
            );

            responder
                .respond(
                    &message.from,
                    &message.message_type,
                    &message.correlation_id,
                    &message.payload,
                )
                .await
                .ok();
        }
    });

    let (caller, _inbox) = Agent::start(AgentOptions {
        hub: "127.0.0.1:8080".to_string(),
        ..Default::default()
    })
    .await?;

    for peer in caller.find("echo").await? {
        let reply = caller
            .request(
                &peer.id,
                "echo",
                &json!({"hello": "fabric"}),
                Some(Duration::from_secs(5)),
            )
            .await?;

        println!("caller got reply: {}", reply);
    }

    caller.shutdown().await;
    echo.shutdown().await;
    Ok(())
}
