//! One connection to the hub control channel.
//!
//! Requests are multiplexed over a single socket: every request carries a
//! random correlation id and a reader task routes each reply to the
//! matching one-shot waiter, in whatever order the hub answers. Requests
//! in flight when the socket dies fail with a transport error; reconnect
//! policy lives a layer up, in the agent runtime.

use std::{sync::Arc, time::Duration};

use ahash::{HashMap, HashMapExt};
use codec::control::{self, ControlAction, ControlReply, ControlRequest};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, watch},
    time::timeout,
};

use codec::frame::FrameDecoder;

use crate::error::{Error, Result};

/// Default deadline for one control request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<ControlReply>>>>;

pub struct HubConnection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    waiters: Waiters,
    closed: watch::Receiver<bool>,
    request_timeout: Duration,
}

impl HubConnection {
    /// Dial the hub and spawn the reply-routing task.
    pub async fn connect(endpoint: &str, request_timeout: Duration) -> Result<Arc<Self>> {
        let stream = timeout(request_timeout, TcpStream::connect(endpoint))
            .await?
            .map_err(|e| Error::Transport(format!("connect {}: {}", endpoint, e)))?;

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::with_capacity(16)));
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(route_replies(reader, waiters.clone(), closed_tx));

        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            waiters,
            closed: closed_rx,
            request_timeout,
        }))
    }

    /// Issue one control request and await its correlated reply. Error
    /// replies come back as `Ok` with `status: "error"`; only transport
    /// faults and timeouts are `Err`.
    pub async fn request(&self, action: ControlAction) -> Result<ControlReply> {
        self.request_with_timeout(action, self.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        action: ControlAction,
        deadline: Duration,
    ) -> Result<ControlReply> {
        let correlation_id = codec::correlation_id();

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(correlation_id.clone(), tx);

        let request = ControlRequest {
            correlation_id: Some(correlation_id.clone()),
            action,
        };

        let line = control::encode_request(&request)?;
        if let Err(e) = self.writer.lock().await.write_all(&line).await {
            self.waiters.lock().remove(&correlation_id);
            return Err(Error::Transport(e.to_string()));
        }

        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Waiter dropped: the reader task tore the table down.
            Ok(Err(_)) => Err(Error::Transport("hub connection closed".to_string())),
            Err(_) => {
                self.waiters.lock().remove(&correlation_id);
                Err(Error::Timeout)
            }
        }
    }

    /// A watch that flips to `true` when the socket dies.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

async fn route_replies(
    mut reader: OwnedReadHalf,
    waiters: Waiters,
    closed_tx: watch::Sender<bool>,
) {
    let mut decoder = FrameDecoder::default();

    'read: loop {
        let value = loop {
            match decoder.next() {
                Ok(Some(value)) => break value,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("hub channel framing fault: {}", e);
                    break 'read;
                }
            }

            match reader.read_buf(decoder.buffer_mut()).await {
                Ok(0) | Err(_) => break 'read,
                Ok(_) => {}
            }
        };

        let reply: ControlReply = match serde_json::from_value(value) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("undecodable hub reply: {}", e);
                continue;
            }
        };

        let Some(correlation_id) = reply.correlation_id.clone() else {
            log::debug!("hub reply without correlation id dropped");
            continue;
        };

        match waiters.lock().remove(&correlation_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => log::debug!("unmatched hub reply: correlationId={}", correlation_id),
        }
    }

    // Fail everything still in flight, then flip the closed watch.
    waiters.lock().clear();
    let _ = closed_tx.send(true);
}
