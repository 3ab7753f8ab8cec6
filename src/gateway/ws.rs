//! WebSocket transport for the realtime gateway

use super::RealtimeGateway;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drive one upgraded socket until either side goes away
pub async fn serve_socket(gateway: Arc<RealtimeGateway>, socket: WebSocket, player_id: String) {
    let (connection_id, mut outbound) = gateway.connect(&player_id);
    let (mut sender, mut receiver) = socket.split();

    let send_player = player_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize {} event: {}", event.event_name(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                debug!("Client {} went away mid-send", send_player);
                break;
            }
        }
        let _ = sender.close().await;
    });

    let recv_gateway = gateway.clone();
    let recv_player = player_id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => recv_gateway.handle_text(&recv_player, &text).await,
                Ok(Message::Close(_)) => {
                    info!("Client {} requested close", recv_player);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error from client {}: {}", recv_player, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut receive_task => {
            send_task.abort();
        }
        _ = &mut send_task => {
            debug!("Outbound channel for {} closed", player_id);
            receive_task.abort();
        }
    }

    gateway.disconnect(&player_id, connection_id).await;
}
