use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use beach_surf_core::{HandshakeError, InstanceHandle, Outbound, StopReason, VerifiedSession};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    protocol::{ClientFrame, ServerFrame},
    state::AppState,
};

pub(crate) fn record_handshake_failure(err: &HandshakeError) {
    counter!(
        "beach_surf_handshakes_failure_total",
        1,
        "reason" => err.metric_label()
    );
}

fn record_handshake_success(view: &str) {
    counter!(
        "beach_surf_handshakes_success_total",
        1,
        "view" => view.to_string()
    );
}

pub(crate) async fn serve(socket: WebSocket, state: Arc<AppState>, verified: VerifiedSession) {
    if let Err(err) = run_connection(socket, state, verified).await {
        warn!("connection ended with error: {err:?}");
    }
}

async fn run_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    verified: VerifiedSession,
) -> Result<()> {
    let (mut ws_tx, ws_rx) = socket.split();
    let view = verified.view().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.outbound_buffer());

    let handle = match state.endpoint().connect(verified, outbound_tx).await {
        Ok(handle) => {
            record_handshake_success(&view);
            handle
        }
        Err(err) => {
            record_handshake_failure(&err);
            let frame = ServerFrame::Disconnect {
                reason: err.metric_label(),
            };
            send_frame(&mut ws_tx, &frame).await?;
            let _ = ws_tx.send(Message::Close(None)).await;
            return Err(err.into());
        }
    };
    state.instance_started();

    let writer_state = Arc::clone(&state);
    let writer_instance = handle.id();
    let writer = tokio::spawn(async move {
        write_frames(ws_tx, outbound_rx, &writer_state).await;
        debug!(instance_id = %writer_instance, "writer task finished");
    });

    let reason = read_frames(ws_rx, &handle, &view).await;

    counter!(
        "beach_surf_instances_terminated_total",
        1,
        "reason" => reason.metric_label()
    );
    state.instance_finished();
    info!(
        instance_id = %handle.id(),
        view = %view,
        reason = reason.metric_label(),
        "view instance finished"
    );

    if let Err(err) = writer.await {
        warn!(instance_id = %handle.id(), error = %err, "writer task failed");
    }
    Ok(())
}

/// Forwards instance output until the final frame, then closes the socket.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    state: &AppState,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        let frame = ServerFrame::from_outbound(outbound, state.endpoint().keyring());
        if let Err(err) = send_frame(&mut ws_tx, &frame).await {
            debug!(error = %err, "client went away before frame was written");
            return;
        }
        if frame.is_final() {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Feeds client frames to the instance until either side finishes. Returns
/// the reason the instance stopped.
async fn read_frames(
    mut ws_rx: SplitStream<WebSocket>,
    handle: &InstanceHandle,
    view: &str,
) -> StopReason {
    loop {
        tokio::select! {
            reason = handle.terminated() => return reason,
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    forward(handle, view, serde_json::from_str(&text)).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    forward(handle, view, serde_json::from_slice(&bytes)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        instance_id = %handle.id(),
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "client closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(instance_id = %handle.id(), error = %err, "error receiving message");
                    break;
                }
                None => break,
            },
        }
    }
    handle.stop();
    handle.terminated().await
}

async fn forward(
    handle: &InstanceHandle,
    view: &str,
    frame: serde_json::Result<ClientFrame>,
) {
    match frame {
        Ok(ClientFrame::Event {
            event,
            origin,
            params,
        }) => {
            counter!("beach_surf_events_total", 1, "view" => view.to_string());
            if let Err(err) = handle.push_event(event, origin, params).await {
                debug!(error = %err, "event arrived after instance stopped");
            }
        }
        Err(err) => {
            warn!(instance_id = %handle.id(), error = %err, "ignoring invalid client frame");
        }
    }
}

async fn send_frame(ws_tx: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<()> {
    let payload = serde_json::to_string(frame)?;
    ws_tx.send(Message::Text(payload)).await?;
    Ok(())
}
