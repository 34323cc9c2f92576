use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, header},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::sync::mpsc;
use tracing::debug;

use super::api::SharedState;
use crate::errors::OrchestratorError;
use crate::orchestrator::events::{Envelope, HubMessage};
use crate::orchestrator::hub::{EventHub, ObserverId, Outbound};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let hub = Arc::clone(&state.plane.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, origin))
}

async fn handle_socket(socket: WebSocket, hub: Arc<EventHub>, origin: Option<String>) {
    let (mut sender, receiver) = socket.split();
    let (id, rx) = match hub.connect(origin) {
        Ok(admitted) => admitted,
        Err(err) => {
            // 1013: try again later.
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: err.to_string().into(),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
            return;
        }
    };
    run_socket_loop(&hub, id, sender, receiver, rx).await;
    hub.disconnect(id);
}

/// Pumps hub frames out to the socket and client frames into the hub until
/// either side goes away. The hub drops its sender when it evicts the
/// observer, which ends the loop and closes the socket.
async fn run_socket_loop(
    hub: &EventHub,
    id: ObserverId,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::Text(text.into()),
                    Some(Outbound::Ping) => Message::Ping(Bytes::new()),
                    None => {
                        debug!(observer = %id, "Observer evicted, closing socket");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                };
                if sender.send(message).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => hub.handle_text(id, text.as_str()),
                    Some(Ok(Message::Pong(_))) => hub.mark_alive(id),
                    Some(Ok(Message::Binary(_))) => {
                        let err = OrchestratorError::MalformedMessage(
                            "Binary frames are not supported".to_string(),
                        );
                        let reply = Envelope::new(HubMessage::from(&err));
                        hub.send(id, &reply);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Err(e)) => {
                        debug!(observer = %id, "Socket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
