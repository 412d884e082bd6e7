use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::{
    domain::{ConversationId, Credential, Identity, MessageId, ParticipantId, Role},
    error::ApiErrorBody,
    protocol::{ChannelCommand, ChannelEvent, Message, OutboundMessage},
};

fn identity() -> Identity {
    Identity {
        participant_id: ParticipantId(4),
        username: "agent@example.com".into(),
        display_name: None,
        role: Role::Agent,
    }
}

#[test]
fn typing_frame_uses_type_and_payload_discriminant() {
    let frame = json!({
        "type": "typing",
        "payload": { "participant": 9, "is_typing": true }
    });
    let event: ChannelEvent = serde_json::from_value(frame).expect("decode typing");
    assert_eq!(
        event,
        ChannelEvent::Typing {
            participant: ParticipantId(9),
            is_typing: true,
        }
    );
}

#[test]
fn message_frame_tolerates_missing_optional_fields() {
    let id = MessageId::new();
    let frame = json!({
        "type": "message",
        "payload": {
            "id": id,
            "conversation_id": 12,
            "body": "site visit moved to friday",
            "created_at": "2024-03-01T10:00:00Z"
        }
    });
    let ChannelEvent::Message(message) = serde_json::from_value(frame).expect("decode message")
    else {
        panic!("expected message event");
    };
    assert_eq!(message.id, id);
    assert_eq!(message.conversation_id, ConversationId(12));
    assert!(message.sender.is_none());
    assert!(message.attachments.is_empty());
    assert!(message.receipts.is_empty());
    assert_eq!(
        message.created_at,
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    );
}

#[test]
fn send_message_command_serializes_client_minted_id() {
    let message = Message {
        id: MessageId::new(),
        conversation_id: ConversationId(1),
        sender: Some(ParticipantId(4)),
        body: "quote approved".into(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        edited_at: None,
        receipts: Vec::new(),
    };
    let command = ChannelCommand::SendMessage(OutboundMessage::from(&message));
    let value = serde_json::to_value(&command).expect("encode");
    assert_eq!(value["type"], "send_message");
    assert_eq!(value["payload"]["id"], json!(message.id.0.to_string()));
    assert_eq!(value["payload"]["body"], "quote approved");
}

#[test]
fn credential_debug_output_redacts_tokens() {
    let credential = Credential {
        access_token: "secret-access".into(),
        refresh_token: Some("secret-refresh".into()),
        identity: identity(),
    };
    let rendered = format!("{credential:?}");
    assert!(!rendered.contains("secret-access"));
    assert!(!rendered.contains("secret-refresh"));
    assert!(rendered.contains("agent@example.com"));
}

#[test]
fn credential_without_refresh_token_cannot_refresh() {
    let mut credential = Credential {
        access_token: "a".into(),
        refresh_token: None,
        identity: identity(),
    };
    assert!(!credential.can_refresh());
    credential.refresh_token = Some(String::new());
    assert!(!credential.can_refresh());
    credential.refresh_token = Some("r".into());
    assert!(credential.can_refresh());
}

#[test]
fn api_error_body_prefers_first_non_empty_field() {
    let body: ApiErrorBody =
        serde_json::from_value(json!({ "message": "  ", "error": "quote is locked" }))
            .expect("decode");
    assert_eq!(body.best_message(), Some("quote is locked"));
    assert_eq!(ApiErrorBody::default().best_message(), None);
}
