//! Live-update WebSocket: one registered push channel per authenticated user.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::types::UserId;
use crate::realtime::{PushChannel, PushError};

use super::HttpState;
use super::auth::AuthenticatedUser;

/// Messages buffered per socket before pushes start to block (and eventually time out).
const OUTBOUND_BUFFER: usize = 64;

/// Push channel feeding the socket's writer task.
struct WsChannel {
    outbound: mpsc::Sender<String>,
}

#[async_trait]
impl PushChannel for WsChannel {
    async fn send(&self, payload: String) -> Result<(), PushError> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| PushError::Closed)
    }
}

pub(super) async fn feed_updates(
    AuthenticatedUser(user_id): AuthenticatedUser,
    State(state): State<HttpState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, user_id, socket))
}

async fn handle_socket(state: HttpState, user_id: UserId, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut pending) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let connection = state
        .registry
        .register(user_id, Arc::new(WsChannel { outbound }));
    info!(%user_id, %connection, "Live connection opened");

    // Ends when the registry drops our channel (replaced or released) or the socket fails.
    let mut writer = tokio::spawn(async move {
        while let Some(payload) = pending.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            message = stream.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%user_id, error = %err, "Live connection read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.registry.release(user_id, connection);
    writer.abort();
    info!(%user_id, %connection, "Live connection closed");
}
