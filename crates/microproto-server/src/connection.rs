//! One WebSocket connection: a reader running the [`SessionMachine`] and a
//! writer draining two queues.
//!
//! The outbound queue is bounded and owned by the engine once the session is
//! established; the control queue carries PONG and locally generated `ERROR`
//! frames and is always drained first.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use microproto_core::ClientId;
use microproto_engine::EngineHandle;

use crate::client::{Client, ClientRegistry};
use crate::session::{Action, SessionMachine};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    pub max_send_queue: usize,
    pub control_queue: usize,
    pub max_message_size: usize,
}

/// Serve a socket until it closes, is cancelled, or breaks the protocol.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client: Arc<Client>,
    registry: Arc<ClientRegistry>,
    engine: EngineHandle,
    limits: ConnectionLimits,
) {
    let client_id = client.id.clone();
    let cancel = client.cancel_token();
    let (ws_tx, ws_rx) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(limits.max_send_queue.max(1));
    let (control_tx, control_rx) = mpsc::channel::<Bytes>(limits.control_queue.max(1));

    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        control_rx,
        outbound_rx,
        cancel.clone(),
        client_id.clone(),
    ));

    read_loop(
        ws_rx,
        &client_id,
        &registry,
        &engine,
        outbound_tx,
        control_tx,
        &cancel,
    )
    .await;

    // Releases the engine's outbound sender; the writer then drains and stops.
    if engine.close(client_id.clone()).await.is_err() {
        debug!(client_id = %client_id, "engine already stopped");
    }
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        cancel.cancel();
        writer.abort();
    }
    registry.unregister(&client_id);
    info!(client_id = %client_id, "WebSocket client disconnected");
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    client_id: &ClientId,
    registry: &ClientRegistry,
    engine: &EngineHandle,
    outbound_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) {
    let mut machine = SessionMachine::new();
    // handed to the engine at HELLO
    let mut outbound_tx = Some(outbound_tx);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let frame = match msg {
            Some(Ok(WsMessage::Binary(data))) => data,
            Some(Ok(WsMessage::Text(_))) => {
                debug!(client_id = %client_id, "ignoring text frame");
                continue;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "WebSocket read error");
                break;
            }
        };
        trace!(client_id = %client_id, len = frame.len(), "frame received");

        match machine.on_frame(frame) {
            Action::Handshake(hello) => {
                let Some(tx) = outbound_tx.take() else {
                    break;
                };
                registry.record_activity(client_id);
                match engine.hello(client_id.clone(), hello, tx).await {
                    Ok(handshake) => {
                        machine.established(handshake.session_id, handshake.max_packet_size);
                        registry.set_session(client_id, handshake.session_id);
                    }
                    Err(e) => {
                        // a protocol refusal leaves an ERROR queued for the peer;
                        // anything else (partial initial sync, engine gone) is cut off
                        let owes_reply = e.as_proto().is_some_and(|p| p.is_fatal_for_session());
                        warn!(client_id = %client_id, error = %e, owes_reply, "handshake refused");
                        if !owes_reply {
                            cancel.cancel();
                        }
                        machine.close();
                        break;
                    }
                }
            }
            Action::Pong(frame) => {
                registry.record_activity(client_id);
                if control_tx.try_send(frame).is_err() {
                    warn!(client_id = %client_id, "control queue full, dropping PONG");
                }
            }
            Action::Forward(frame) => {
                registry.record_activity(client_id);
                if engine.update(client_id.clone(), frame).await.is_err() {
                    warn!(client_id = %client_id, "engine stopped");
                    break;
                }
            }
            Action::Reject(frame) => {
                debug!(client_id = %client_id, "oversize frame rejected");
                if control_tx.try_send(frame).is_err() {
                    warn!(client_id = %client_id, "control queue full, dropping ERROR");
                }
            }
            Action::Ignore => {}
            Action::Close(e) => {
                warn!(client_id = %client_id, error = %e, error_kind = e.error_kind(), "closing connection");
                // no response is owed; stop the writer immediately
                cancel.cancel();
                break;
            }
        }
    }
}

async fn write_loop<S>(
    mut ws_tx: S,
    mut control_rx: mpsc::Receiver<Bytes>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    client_id: ClientId,
) where
    S: Sink<WsMessage> + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(frame) = control_rx.recv() => frame,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if ws_tx.send(WsMessage::Binary(frame)).await.is_err() {
            break;
        }
    }

    // flush control frames queued alongside the last outbound ones
    while let Ok(frame) = control_rx.try_recv() {
        if cancel.is_cancelled() || ws_tx.send(WsMessage::Binary(frame)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.send(WsMessage::Close(None)).await;
    trace!(client_id = %client_id, "writer finished");
    cancel.cancel();
}
