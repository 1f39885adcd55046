use serde::{Deserialize, Serialize};

use crate::types::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, JoinResponse, MediaKind, PeerId, ProducerId,
    RoomId, RtpCapabilities, RtpParameters, TransportDescriptor, TransportDirection, TransportId,
};

/// A request frame sent from client to server.
///
/// `request_id` is echoed back on the matching response or error so clients
/// can correlate replies with in-flight requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub request_id: u64,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join a room, creating it if this is the first peer
    JoinRoom {
        room_id: RoomId,
        peer_id: PeerId,
        #[serde(default)]
        rtp_capabilities: RtpCapabilities,
    },

    /// Complete the DTLS parameter exchange for a transport
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Start publishing on a send transport
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Subscribe to a producer on a receive transport
    Consume {
        room_id: RoomId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    ResumeConsumer { consumer_id: ConsumerId },

    PauseConsumer { consumer_id: ConsumerId },

    CloseConsumer { consumer_id: ConsumerId },

    CloseProducer { producer_id: ProducerId },

    CloseTransport { transport_id: TransportId },

    LeaveRoom { room_id: RoomId },

    /// Fetch the codec profile of a room's router
    GetRouterRtpCapabilities { room_id: RoomId },

    /// Create an additional transport, e.g. after a router reset
    CreateTransport {
        room_id: RoomId,
        direction: TransportDirection,
    },
}

impl ClientMessage {
    /// Wire name of the message, for logging
    pub fn method(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "joinRoom",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resumeConsumer",
            ClientMessage::PauseConsumer { .. } => "pauseConsumer",
            ClientMessage::CloseConsumer { .. } => "closeConsumer",
            ClientMessage::CloseProducer { .. } => "closeProducer",
            ClientMessage::CloseTransport { .. } => "closeTransport",
            ClientMessage::LeaveRoom { .. } => "leaveRoom",
            ClientMessage::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            ClientMessage::CreateTransport { .. } => "createTransport",
        }
    }
}

/// Payload of a successful response.
///
/// Untagged on the wire: the shape of the payload is implied by the request
/// it answers. Variants with more required fields come first so that
/// deserialization picks the most specific one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ResponseData {
    Joined(JoinResponse),
    Consumed(ConsumerDescriptor),
    TransportCreated { transport: TransportDescriptor },
    RouterRtpCapabilities { rtp_capabilities: RtpCapabilities },
    Produced { id: ProducerId },
    Connected { connected: bool },
    Resumed { resumed: bool },
    Paused { paused: bool },
    Closed { closed: bool },
    Left { left: bool },
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Successful reply to a request
    Response { request_id: u64, data: ResponseData },

    /// Failed request, or an unparseable frame when `request_id` is absent
    Error {
        request_id: Option<u64>,
        code: String,
        message: String,
    },

    /// Another peer joined the room
    NewPeer { peer_id: PeerId },

    /// Another peer started publishing
    NewProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    },

    /// A producer in the room was closed
    ProducerClosed {
        peer_id: PeerId,
        producer_id: ProducerId,
    },

    /// One of the recipient's consumers was closed because its producer went away
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },

    /// Another peer left the room
    PeerLeft { peer_id: PeerId },

    /// The room's router was recreated; existing transports are gone
    RouterReset { room_id: RoomId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_request() {
        let text = r#"{
            "requestId": 7,
            "type": "joinRoom",
            "roomId": "r1",
            "peerId": "A",
            "rtpCapabilities": {
                "codecs": [{ "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }]
            }
        }"#;

        let request: ClientRequest = serde_json::from_str(text).unwrap();
        assert_eq!(request.request_id, 7);
        match request.message {
            ClientMessage::JoinRoom {
                room_id,
                peer_id,
                rtp_capabilities,
            } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(peer_id.as_str(), "A");
                assert_eq!(rtp_capabilities.codecs.len(), 1);
                assert_eq!(rtp_capabilities.codecs[0].kind, MediaKind::Audio);
            }
            other => panic!("Expected JoinRoom, got {:?}", other),
        }
    }

    #[test]
    fn test_event_wire_format() {
        let producer_id = ProducerId::new();
        let event = ServerMessage::NewProducer {
            peer_id: PeerId::from("A"),
            producer_id,
            kind: MediaKind::Audio,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["peerId"], "A");
        assert_eq!(value["producerId"], producer_id.to_string());
        assert_eq!(value["kind"], "audio");
    }

    #[test]
    fn test_untagged_response_picks_specific_variant() {
        let consumed = r#"{
            "type": "response",
            "requestId": 3,
            "data": {
                "id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
                "producerId": "a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8",
                "kind": "audio",
                "rtpParameters": { "codecs": [] },
                "paused": true
            }
        }"#;
        match serde_json::from_str::<ServerMessage>(consumed).unwrap() {
            ServerMessage::Response {
                data: ResponseData::Consumed(descriptor),
                ..
            } => assert!(descriptor.paused),
            other => panic!("Expected consumer descriptor, got {:?}", other),
        }

        let paused = r#"{ "type": "response", "requestId": 4, "data": { "paused": true } }"#;
        match serde_json::from_str::<ServerMessage>(paused).unwrap() {
            ServerMessage::Response {
                data: ResponseData::Paused { paused },
                ..
            } => assert!(paused),
            other => panic!("Expected paused ack, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let text = r#"{ "requestId": 1, "type": "restartIce", "transportId": "x" }"#;
        assert!(serde_json::from_str::<ClientRequest>(text).is_err());
    }
}
