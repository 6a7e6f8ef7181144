//! Raw records emitted by the agent subprocess, one JSON object per line.
//!
//! Loosely-typed payloads stop here: everything crossing into the event log
//! is one of the closed `SessionEvent` variants. Unknown discriminants parse
//! to `Unknown` so future record kinds never break the pipeline.

use serde::Deserialize;
use serde_json::Value;

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RawRecord {
    ContentBlockDelta {
        #[serde(default)]
        delta: Option<RawDelta>,
        #[serde(default)]
        index: Option<Value>,
    },
    ContentBlockStart {
        #[serde(default)]
        content_block: Option<RawContentBlock>,
    },
    ContentBlockStop {
        #[serde(default)]
        index: Option<Value>,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<RawUsage>,
    },
    MessageStop,
    SessionId {
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        #[serde(default)]
        error: Option<RawError>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RawDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RawContentBlock {
    ToolUse {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RawUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct RawError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Tool ids arrive as a numeric or string block index; anything else falls
/// back to the documented literal.
pub(crate) fn tool_id_from_index(index: Option<&Value>) -> String {
    match index {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_record() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        match record {
            RawRecord::ContentBlockDelta {
                delta: Some(RawDelta::TextDelta { text }),
                ..
            } => assert_eq!(text, "Hi"),
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn tool_use_start_record() {
        let line = r#"{"type":"content_block_start","content_block":{"type":"tool_use","name":"grep","id":"t1"}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        match record {
            RawRecord::ContentBlockStart {
                content_block: Some(RawContentBlock::ToolUse { name, id }),
            } => {
                assert_eq!(name.as_deref(), Some("grep"));
                assert_eq!(id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn unknown_discriminant_does_not_fail() {
        let line = r#"{"type":"brand_new_record_kind","payload":{"x":1}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        assert!(matches!(record, RawRecord::Unknown));
    }

    #[test]
    fn unknown_delta_kind_does_not_fail() {
        let line = r#"{"type":"content_block_delta","delta":{"type":"citation_delta"}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        match record {
            RawRecord::ContentBlockDelta {
                delta: Some(RawDelta::Unknown),
                ..
            } => {}
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn non_json_is_a_parse_error() {
        assert!(serde_json::from_str::<RawRecord>("reading config from ~/.agentrc").is_err());
    }

    #[test]
    fn tool_id_fallbacks() {
        assert_eq!(tool_id_from_index(Some(&Value::from(3))), "3");
        assert_eq!(
            tool_id_from_index(Some(&Value::from("tool-7"))),
            "tool-7"
        );
        assert_eq!(tool_id_from_index(Some(&Value::Null)), "unknown");
        assert_eq!(tool_id_from_index(None), "unknown");
    }

    #[test]
    fn error_record_with_and_without_message() {
        let line = r#"{"type":"error","error":{"message":"rate limited"}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        match record {
            RawRecord::Error { error: Some(e) } => {
                assert_eq!(e.message.as_deref(), Some("rate limited"));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        let bare = r#"{"type":"error"}"#;
        let record: RawRecord = serde_json::from_str(bare).unwrap();
        assert!(matches!(record, RawRecord::Error { error: None }));
    }

    #[test]
    fn usage_record() {
        let line = r#"{"type":"message_delta","usage":{"input_tokens":10,"output_tokens":25}}"#;
        let record: RawRecord = serde_json::from_str(line).unwrap();
        match record {
            RawRecord::MessageDelta { usage: Some(u) } => {
                assert_eq!(u.input_tokens, Some(10));
                assert_eq!(u.output_tokens, Some(25));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
