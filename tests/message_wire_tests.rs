//! Wire-shape tests for the canonical message model.

use agentkit::message::{FileContent, Message, Part, Role};
use serde_json::json;

#[test]
fn test_full_message_round_trip() {
    let mut msg = Message::new(
        Role::User,
        vec![
            Part::text("please summarize the attachment"),
            Part::File {
                file: FileContent {
                    name: Some("report.pdf".into()),
                    mime_type: Some("application/pdf".into()),
                    bytes: None,
                    uri: Some("https://example.com/report.pdf".into()),
                },
            },
            Part::data(json!({"priority": "high"})),
        ],
    )
    .with_id("m-77")
    .with_context_id("conv-3")
    .with_task_id("task-9")
    .with_metadata("source", json!("inbox"));
    msg.reference_task_ids = vec!["task-1".into(), "task-2".into()];

    let encoded = serde_json::to_string(&msg).unwrap();
    let decoded: Message = serde_json::from_str(&encoded).unwrap();
    assert_eq!(msg, decoded);
    assert!(decoded.validate().is_ok());
}

#[test]
fn test_inbound_wire_shape_decodes() {
    // The exact shape a peer posts to /v1/messages.
    let decoded: Message = serde_json::from_value(json!({
        "messageId": "m1",
        "role": "user",
        "parts": [{"kind": "text", "text": "hi"}],
        "kind": "message",
    }))
    .unwrap();
    assert_eq!(decoded.message_id, "m1");
    assert_eq!(decoded.role, Role::User);
    assert_eq!(decoded.text(), "hi");
    assert!(decoded.context_id.is_none());
    assert!(decoded.metadata.is_empty());
}

#[test]
fn test_invalid_role_rejected_at_decode() {
    let result: Result<Message, _> = serde_json::from_value(json!({
        "messageId": "m1",
        "role": "overlord",
        "parts": [{"kind": "text", "text": "hi"}],
    }));
    assert!(result.is_err());
}

#[test]
fn test_optional_fields_omitted_from_wire() {
    let value = serde_json::to_value(Message::user_text("hi").with_id("m1")).unwrap();
    let object = value.as_object().unwrap();
    assert!(!object.contains_key("contextId"));
    assert!(!object.contains_key("taskId"));
    assert!(!object.contains_key("referenceTaskIds"));
    assert!(!object.contains_key("metadata"));
}
