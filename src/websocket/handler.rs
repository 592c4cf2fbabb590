use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{CollabError, ProtocolError};
use crate::models::{server_events, ClientEvent, Envelope, ErrorCode, ErrorResponse};
use crate::services::auth_service::{extract_token, Claims};
use crate::websocket::msg_cursor_handler::{handle_cursor_hide_message, handle_cursor_move_message};
use crate::websocket::msg_form_handler::handle_form_save_message;
use crate::websocket::msg_heartbeat_handler::handle_heartbeat_message;
use crate::websocket::msg_join_handler::handle_join_message;
use crate::websocket::msg_leave_handler::handle_leave_message;
use crate::websocket::msg_question_handler::{handle_question_activity_message, handle_question_update_message};
use crate::websocket::msg_typing_handler::handle_typing_message;
use crate::ws::connctx::{CloseReason, ConnCtx, DeviceInfo};
use crate::ws::guard::ConnectionGuard;
use crate::ws::hub::CollabHub;

/// Frames above this multiple of the message limit close the socket
const TRANSPORT_LIMIT_FACTOR: usize = 4;

/// WebSocket upgrade. The bearer token is verified before the upgrade.
pub async fn websocket_handler(
    State(hub): State<Arc<CollabHub>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    info!("New WebSocket connection attempt");

    // 1. Get the auth token from the request and validate it
    let claims = match extract_token(&headers, uri.query()).and_then(|token| hub.authenticate(&token)) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("WebSocket upgrade refused: {}", e);
            let status = StatusCode::UNAUTHORIZED;
            return (
                status,
                Json(ErrorResponse {
                    code: status.as_u16(),
                    status: status.to_string(),
                    error: format!("{}: {}", ErrorCode::AuthenticationFailed.as_str(), e),
                }),
            )
                .into_response();
        }
    };

    // 2. No new connections while draining
    if hub.is_shutting_down() {
        let status = StatusCode::SERVICE_UNAVAILABLE;
        return (
            status,
            Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: "Server is shutting down".to_string(),
            }),
        )
            .into_response();
    }

    // 3. Upgrade
    let device = DeviceInfo::from_headers(&headers);
    let transport_limit = hub.config().max_message_size * TRANSPORT_LIMIT_FACTOR;
    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| handle_socket(socket, hub, claims, device))
}

/// Handle WebSocket connection
async fn handle_socket(mut socket: WebSocket, hub: Arc<CollabHub>, claims: Claims, device: DeviceInfo) {
    let (conn, outbound) = match hub.connect(claims, device).await {
        Ok(connected) => connected,
        Err(e) => {
            error!("Failed to register connection: {}", e);
            let envelope = Envelope::new(server_events::ERROR, &e.to_payload());
            let _ = socket.send(Message::Text(envelope.to_json())).await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CloseReason::StoreFailure.close_code(),
                    reason: CloseReason::StoreFailure.as_str().into(),
                })))
                .await;
            return;
        }
    };
    info!(connection_id = %conn.id, user_id = conn.user_id(), "WebSocket connection established");
    let _guard = ConnectionGuard::new(hub.clone(), conn.clone());

    // Split the socket into sender and receiver
    let (sender, receiver) = socket.split();

    // One task writes the outbound queue to the socket, the other processes inbound frames
    let mut send_task = tokio::spawn(write_loop(sender, outbound, hub.clone(), conn.clone()));
    let mut recv_task = tokio::spawn(read_loop(receiver, hub.clone(), conn.clone()));

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    hub.disconnect(&conn).await;
    info!(connection_id = %conn.id, "WebSocket connection terminated");
}

async fn read_loop(mut receiver: SplitStream<WebSocket>, hub: Arc<CollabHub>, conn: Arc<ConnCtx>) {
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                // Includes frames above the transport limit
                debug!(connection_id = %conn.id, "WebSocket receive error: {}", e);
                break;
            }
        };
        conn.touch();
        match frame {
            Message::Text(text) => hub.handle_frame(&conn, &text).await,
            Message::Binary(_) => hub.reply_error(&conn, &CollabError::from(ProtocolError::Binary)),
            // Pings are answered by the transport
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<Envelope>>,
    hub: Arc<CollabHub>,
    conn: Arc<ConnCtx>,
) {
    let mut keepalive = tokio::time::interval(hub.config().ping_interval());
    keepalive.tick().await;

    loop {
        tokio::select! {
            biased;

            // Evicted or timed out: close without draining
            _ = conn.cancelled() => {
                let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: reason.close_code(),
                        reason: reason.as_str().into(),
                    })))
                    .await;
                break;
            }

            // Shutdown: flush what is queued, bounded by the drain timeout
            _ = hub.shutdown_token().cancelled() => {
                drain(&mut sender, &mut outbound, hub.config().shutdown_drain()).await;
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: CloseReason::Shutdown.as_str().into(),
                    })))
                    .await;
                conn.close(CloseReason::Shutdown);
                break;
            }

            envelope = outbound.recv() => match envelope {
                Some(envelope) => {
                    if sender.send(Message::Text(envelope.to_json())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            _ = keepalive.tick() => {
                if conn.idle_for() > hub.config().idle_timeout() {
                    info!(connection_id = %conn.id, "Closing idle connection");
                    conn.close(CloseReason::IdleTimeout);
                    continue;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                if let Err(e) = hub.touch_connection(&conn).await {
                    warn!(connection_id = %conn.id, "Failed to refresh connection record: {}", e);
                }
            }
        }
    }
}

async fn drain(
    sender: &mut SplitSink<WebSocket, Message>,
    outbound: &mut mpsc::Receiver<Arc<Envelope>>,
    timeout: Duration,
) {
    let flushed = tokio::time::timeout(timeout, async {
        while let Ok(envelope) = outbound.try_recv() {
            if sender.send(Message::Text(envelope.to_json())).await.is_err() {
                break;
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("Outbound queue not drained before the shutdown deadline");
    }
}

/// Route a decoded client event to its handler
pub async fn dispatch_event(
    hub: &CollabHub,
    conn: &Arc<ConnCtx>,
    event: ClientEvent,
    sent_at: i64,
) -> Result<(), CollabError> {
    match event {
        ClientEvent::JoinForm(payload) => handle_join_message(hub, conn, payload).await,
        ClientEvent::LeaveForm(payload) => handle_leave_message(hub, conn, payload).await,
        ClientEvent::CursorMove(payload) => handle_cursor_move_message(hub, conn, payload).await,
        ClientEvent::CursorHide(payload) => handle_cursor_hide_message(hub, conn, payload).await,
        ClientEvent::QuestionUpdate(payload) => handle_question_update_message(hub, conn, payload).await,
        ClientEvent::QuestionFocus(payload) => {
            handle_question_activity_message(hub, conn, payload, server_events::QUESTION_FOCUSED).await
        }
        ClientEvent::QuestionBlur(payload) => {
            handle_question_activity_message(hub, conn, payload, server_events::QUESTION_BLURRED).await
        }
        ClientEvent::FormSave(payload) => handle_form_save_message(hub, conn, payload).await,
        ClientEvent::UserTyping(payload) => {
            handle_typing_message(hub, conn, payload, server_events::USER_TYPING).await
        }
        ClientEvent::UserStoppedTyping(payload) => {
            handle_typing_message(hub, conn, payload, server_events::USER_STOPPED_TYPING).await
        }
        ClientEvent::Heartbeat(payload) => handle_heartbeat_message(hub, conn, payload, sent_at).await,
    }
}
