//! The peer-to-peer session engine.
//!
//! A session is one TCP connection carrying one X25519 agreement and at
//! least one application frame. The initiator side opens a connection per
//! outgoing send, completes the handshake, delivers a single sealed
//! message and waits for its ack; the responder side accepts a session,
//! answers the handshake and serves application frames until the peer
//! closes or goes idle. Session keys never outlive the connection.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use codec::{
    crypto::{self, Keypair},
    frame::FrameDecoder,
    peer::{self, Envelope, PeerFrame, SessionFrame},
};

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
    time::timeout,
};

use crate::error::{Error, Result};

/// Receive-idle deadline on the accepting side.
pub const RESPONDER_IDLE: Duration = Duration::from_secs(30);
/// Connect plus per-frame deadline on the dialing side.
pub const INITIATOR_IDLE: Duration = Duration::from_secs(10);

/// A decrypted application message dispatched up to the runtime.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub from: String,
    pub message_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub timestamp: u64,
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// Buffered frame reader over one read half.
pub(crate) struct FrameReader {
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
}

impl FrameReader {
    pub fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::default(),
        }
    }

    /// Next frame, or an error on idle timeout, close or framing fault.
    pub async fn next(&mut self, idle: Duration) -> Result<Value> {
        loop {
            if let Some(value) = self.decoder.next()? {
                return Ok(value);
            }

            let size = timeout(idle, self.reader.read_buf(self.decoder.buffer_mut())).await??;
            if size == 0 {
                return Err(Error::Transport("connection closed".to_string()));
            }
        }
    }
}

pub(crate) async fn write_frame(writer: &mut OwnedWriteHalf, frame: &SessionFrame) -> Result<()> {
    writer.write_all(&peer::encode(frame)?).await?;
    Ok(())
}

/// Dial a peer and deliver one sealed message.
///
/// Opens the connection, runs the handshake, seals the payload under the
/// fresh session key, sends the `message` frame and waits for the
/// matching `ack`. Every await is bounded by the initiator deadline. The
/// connection closes when this returns, successful or not.
pub async fn dial(
    address: &str,
    local_id: &str,
    message_type: &str,
    payload: &Value,
    correlation_id: &str,
) -> Result<()> {
    let stream = timeout(INITIATOR_IDLE, TcpStream::connect(address))
        .await?
        .map_err(|e| Error::Transport(format!("connect {}: {}", address, e)))?;

    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader);

    let keypair = Keypair::generate();
    write_frame(
        &mut writer,
        &SessionFrame::Handshake {
            key: keypair.public_spki(),
            from: local_id.to_string(),
        },
    )
    .await?;

    let peer_key = loop {
        match peer::classify(frames.next(INITIATOR_IDLE).await?)? {
            PeerFrame::Session(SessionFrame::HandshakeAck { key }) => break key,
            PeerFrame::Session(SessionFrame::Ping) => {
                write_frame(&mut writer, &SessionFrame::Pong).await?
            }
            PeerFrame::Session(SessionFrame::Pong) => {}
            PeerFrame::Fault(error) => return Err(fault_error(error)),
            PeerFrame::Session(_) => {
                return Err(Error::Protocol(
                    "unexpected frame before key agreement".to_string(),
                ))
            }
        }
    };

    let session_key = keypair.derive(&peer_key)?;

    let envelope = Envelope {
        payload: payload.clone(),
        correlation_id: correlation_id.to_string(),
    };

    let plaintext =
        serde_json::to_vec(&envelope).map_err(|e| Error::Protocol(e.to_string()))?;

    write_frame(
        &mut writer,
        &SessionFrame::Message {
            message_type: message_type.to_string(),
            data: crypto::seal(&session_key, &plaintext)?,
            correlation_id: correlation_id.to_string(),
        },
    )
    .await?;

    loop {
        match peer::classify(frames.next(INITIATOR_IDLE).await?)? {
            PeerFrame::Session(SessionFrame::Ack {
                correlation_id: acked,
            }) if acked == correlation_id => return Ok(()),
            PeerFrame::Session(SessionFrame::Ack { .. }) => {}
            PeerFrame::Session(SessionFrame::Ping) => {
                write_frame(&mut writer, &SessionFrame::Pong).await?
            }
            PeerFrame::Session(SessionFrame::Pong) => {}
            PeerFrame::Fault(error) => return Err(fault_error(error)),
            PeerFrame::Session(_) => {
                return Err(Error::Protocol("unexpected frame after message".to_string()))
            }
        }
    }
}

fn fault_error(error: String) -> Error {
    if error == peer::ERROR_DECRYPTION_FAILED {
        Error::Crypto
    } else {
        Error::Application(error)
    }
}

/// Serve one accepted session until the peer closes, goes idle or faults.
pub async fn serve(stream: TcpStream, incoming: mpsc::Sender<Incoming>) {
    let peer_addr = stream
        .peer_addr()
        .map(|it| it.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(e) = respond(stream, incoming).await {
        log::debug!("session closed: addr={}, reason={}", peer_addr, e);
    }
}

async fn respond(stream: TcpStream, incoming: mpsc::Sender<Incoming>) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader);

    // AWAIT-HELLO: nothing but a handshake is acceptable here. An
    // application frame on an unkeyed session drops the connection.
    let first = match frames.next(RESPONDER_IDLE).await {
        Ok(value) => value,
        Err(Error::Protocol(reason)) => {
            let _ = writer
                .write_all(&peer::encode_fault(peer::ERROR_INVALID_MESSAGE))
                .await;
            return Err(Error::Protocol(reason));
        }
        Err(e) => return Err(e),
    };

    let (peer_id, session_key) = match peer::classify(first)? {
        PeerFrame::Session(SessionFrame::Handshake { key, from }) => {
            let keypair = Keypair::generate();
            let session_key = keypair.derive(&key)?;

            write_frame(
                &mut writer,
                &SessionFrame::HandshakeAck {
                    key: keypair.public_spki(),
                },
            )
            .await?;

            (from, session_key)
        }
        PeerFrame::Fault(error) => return Err(Error::Application(error)),
        PeerFrame::Session(_) => {
            let _ = writer
                .write_all(&peer::encode_fault(peer::ERROR_INVALID_MESSAGE))
                .await;

            return Err(Error::Protocol(
                "application frame before key agreement".to_string(),
            ));
        }
    };

    // KEYED: serve application frames until the peer goes away. The
    // reference initiator sends one message and closes, but anything the
    // grammar allows is served.
    loop {
        let value = match frames.next(RESPONDER_IDLE).await {
            Ok(value) => value,
            Err(Error::Protocol(reason)) => {
                let _ = writer
                    .write_all(&peer::encode_fault(peer::ERROR_INVALID_MESSAGE))
                    .await;
                return Err(Error::Protocol(reason));
            }
            Err(e) => return Err(e),
        };

        match peer::classify(value)? {
            PeerFrame::Session(SessionFrame::Message {
                message_type,
                data,
                correlation_id,
            }) => {
                // A failed open is reported to the sender and the session
                // stays up; only the sender treats it as fatal.
                let plaintext = match crypto::open(&session_key, &data) {
                    Ok(plaintext) => plaintext,
                    Err(_) => {
                        writer
                            .write_all(&peer::encode_fault(peer::ERROR_DECRYPTION_FAILED))
                            .await?;
                        continue;
                    }
                };

                let envelope: Envelope = serde_json::from_slice(&plaintext)
                    .map_err(|e| Error::Protocol(e.to_string()))?;

                write_frame(
                    &mut writer,
                    &SessionFrame::Ack {
                        correlation_id: correlation_id.clone(),
                    },
                )
                .await?;

                let message = Incoming {
                    from: peer_id.clone(),
                    message_type,
                    payload: envelope.payload,
                    correlation_id,
                    timestamp: now_ms(),
                };

                // Receiver gone means the runtime is tearing down.
                if incoming.send(message).await.is_err() {
                    return Ok(());
                }
            }
            PeerFrame::Session(SessionFrame::Ping) => {
                write_frame(&mut writer, &SessionFrame::Pong).await?
            }
            PeerFrame::Session(SessionFrame::Pong) => {}
            PeerFrame::Session(SessionFrame::Ack { .. }) => {}
            PeerFrame::Fault(error) => return Err(Error::Application(error)),
            PeerFrame::Session(_) => {
                let _ = writer
                    .write_all(&peer::encode_fault(peer::ERROR_INVALID_MESSAGE))
                    .await;

                return Err(Error::Protocol("unexpected handshake frame".to_string()));
            }
        }
    }
}
