use crate::error::Result;
use crate::sfu::PeerSession;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chorus_protocol::{ClientMessage, ClientRequest, ResponseData, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let connection_id = Uuid::new_v4();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Register connection with the connection manager
    state.connections.add_connection(connection_id, tx).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::info!("Connection {} opened", connection_id);

    let mut session = PeerSession::new(connection_id);

    // Requests are handled one at a time, in arrival order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let request = match parse_request(&text) {
                    Ok(r) => r,
                    Err((request_id, e)) => {
                        tracing::warn!("Invalid message from {}: {}", connection_id, e);
                        state
                            .connections
                            .send_to_connection(
                                connection_id,
                                &ServerMessage::Error {
                                    request_id,
                                    code: "invalid_request".to_string(),
                                    message: format!("Invalid message format: {}", e),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                let reply = handle_request(&state, &mut session, request).await;
                state
                    .connections
                    .send_to_connection(connection_id, &reply)
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.rooms.disconnect(&mut session).await;
    state.connections.remove_connection(connection_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Connection {} closed", connection_id);
}

/// Decode a request frame. A frame that is JSON but not a valid request
/// still yields its `requestId`, so the error can be correlated.
fn parse_request(
    text: &str,
) -> std::result::Result<ClientRequest, (Option<u64>, serde_json::Error)> {
    let value: Value = serde_json::from_str(text).map_err(|e| (None, e))?;
    let request_id = value.get("requestId").and_then(Value::as_u64);
    serde_json::from_value(value).map_err(|e| (request_id, e))
}

async fn handle_request(
    state: &AppState,
    session: &mut PeerSession,
    request: ClientRequest,
) -> ServerMessage {
    let request_id = request.request_id;
    let method = request.message.method();

    tracing::debug!(
        "Request {} ({}) from connection {}",
        request_id,
        method,
        session.connection_id
    );

    match dispatch(state, session, request.message).await {
        Ok(data) => ServerMessage::Response { request_id, data },
        Err(e) => {
            tracing::warn!(
                "{} failed for peer {} in room {}: {}",
                method,
                session.peer_id().map(|p| p.as_str()).unwrap_or("-"),
                session.room_id().map(|r| r.as_str()).unwrap_or("-"),
                e
            );
            ServerMessage::Error {
                request_id: Some(request_id),
                code: e.code().to_string(),
                message: e.to_string(),
            }
        }
    }
}

async fn dispatch(
    state: &AppState,
    session: &mut PeerSession,
    message: ClientMessage,
) -> Result<ResponseData> {
    let rooms = &state.rooms;

    match message {
        ClientMessage::JoinRoom {
            room_id,
            peer_id,
            rtp_capabilities,
        } => {
            let joined = rooms
                .join(session, room_id, peer_id, rtp_capabilities)
                .await?;
            Ok(ResponseData::Joined(joined))
        }
        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            rooms
                .connect_transport(session, transport_id, dtls_parameters)
                .await?;
            Ok(ResponseData::Connected { connected: true })
        }
        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let id = rooms
                .produce(session, transport_id, kind, rtp_parameters)
                .await?;
            Ok(ResponseData::Produced { id })
        }
        ClientMessage::Consume {
            room_id,
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let consumer = rooms
                .consume(session, &room_id, transport_id, producer_id, rtp_capabilities)
                .await?;
            Ok(ResponseData::Consumed(consumer))
        }
        ClientMessage::ResumeConsumer { consumer_id } => {
            rooms.resume_consumer(session, consumer_id).await?;
            Ok(ResponseData::Resumed { resumed: true })
        }
        ClientMessage::PauseConsumer { consumer_id } => {
            rooms.pause_consumer(session, consumer_id).await?;
            Ok(ResponseData::Paused { paused: true })
        }
        ClientMessage::CloseConsumer { consumer_id } => {
            rooms.close_consumer(session, consumer_id).await;
            Ok(ResponseData::Closed { closed: true })
        }
        ClientMessage::CloseProducer { producer_id } => {
            rooms.close_producer(session, producer_id).await?;
            Ok(ResponseData::Closed { closed: true })
        }
        ClientMessage::CloseTransport { transport_id } => {
            rooms.close_transport(session, transport_id).await?;
            Ok(ResponseData::Closed { closed: true })
        }
        ClientMessage::LeaveRoom { room_id } => {
            rooms.leave(session, &room_id).await?;
            Ok(ResponseData::Left { left: true })
        }
        ClientMessage::GetRouterRtpCapabilities { room_id } => {
            let rtp_capabilities = rooms.router_rtp_capabilities(&room_id).await;
            Ok(ResponseData::RouterRtpCapabilities { rtp_capabilities })
        }
        ClientMessage::CreateTransport { room_id, direction } => {
            let transport = rooms.create_transport(session, &room_id, direction).await?;
            Ok(ResponseData::TransportCreated { transport })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_keeps_request_id_of_bad_frames() {
        let request = parse_request(r#"{"requestId": 3, "type": "leaveRoom", "roomId": "r1"}"#)
            .unwrap();
        assert_eq!(request.request_id, 3);

        let (request_id, _) = parse_request(r#"{"requestId": 9, "type": "teleport"}"#).unwrap_err();
        assert_eq!(request_id, Some(9));

        let (request_id, _) =
            parse_request(r#"{"requestId": 10, "type": "produce", "transportId": "x"}"#)
                .unwrap_err();
        assert_eq!(request_id, Some(10));

        let (request_id, _) = parse_request("{ not json").unwrap_err();
        assert_eq!(request_id, None);
    }
}
