//! Wire protocol frames.
//!
//! JSON text frames over any ordered bidirectional channel. Control
//! frames carry a `type` tag; the plain request/response call frames do
//! not, so decoding tries the tagged shapes first and falls back to the
//! bare call shape.

use crate::change::ChangeOp;
use crate::error::ProtocolError;
use crate::page::PageResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Client → Server
// ============================================================================

/// Request/response call: `{"id", "fn", "args"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Tagged client control frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Open a document subscription. `args` carries the instance id.
    Open {
        #[serde(rename = "fn")]
        function: String,
        args: Vec<i64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        cursor: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        limit: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        stream: Option<bool>,
    },
    /// Close a document subscription. No response.
    Close {
        #[serde(rename = "fn")]
        function: String,
        args: Vec<i64>,
    },
    /// Fetch one page inline without touching the subscription.
    Fetch {
        id: u64,
        #[serde(rename = "fn")]
        function: String,
        args: Vec<i64>,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
    },
}

/// Any client→server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Control(ControlFrame),
    Call(CallFrame),
}

impl ClientFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server → Client
// ============================================================================

/// Reply to a call or fetch: `{"id", "ok":true, "data"}` or
/// `{"id", "ok":false, "error"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn success(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn page(id: u64, page: &PageResult) -> Result<Self, ProtocolError> {
        Ok(Self::success(id, serde_json::to_value(page)?))
    }
}

/// Push notification for one (document, target) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyFrame {
    pub doc: String,
    pub doc_id: i64,
    pub op: ChangeOp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_ids: Option<Vec<i64>>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cursor: Option<String>,
    #[serde(rename = "hasMore", skip_serializing_if = "Option::is_none", default)]
    pub has_more: Option<bool>,
}

/// Tagged server push frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// Document change notification.
    Notify(NotifyFrame),
    /// Scoped error for one document key (e.g. a failed initial load).
    Error {
        #[serde(rename = "fn")]
        function: String,
        doc_id: i64,
        error: String,
    },
    /// Principal-scoped startup payload, sent once per connection.
    Profile { data: Value },
}

/// Any server→client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Push(PushFrame),
    Response(ResponseFrame),
}

impl ServerFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Best-effort extraction of a request id from an arbitrary (possibly
/// half-malformed) frame, for scoped error replies.
pub fn request_id(text: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("id")?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open_frame() {
        let frame = ClientFrame::decode(
            r#"{"type":"open","fn":"thing","args":[7],"cursor":null,"limit":20,"stream":true}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Control(ControlFrame::Open {
                function,
                args,
                cursor,
                limit,
                stream,
            }) => {
                assert_eq!(function, "thing");
                assert_eq!(args, vec![7]);
                assert_eq!(cursor, None);
                assert_eq!(limit, Some(20));
                assert_eq!(stream, Some(true));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_bare_call_frame() {
        let frame = ClientFrame::decode(r#"{"id":3,"fn":"create_thing","args":[{"name":"A"}]}"#)
            .unwrap();
        match frame {
            ClientFrame::Call(call) => {
                assert_eq!(call.id, 3);
                assert_eq!(call.function, "create_thing");
                assert_eq!(call.args, vec![json!({"name":"A"})]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_close_frame() {
        let frame = ClientFrame::decode(r#"{"type":"close","fn":"thing","args":[7]}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Control(ControlFrame::Close {
                function: "thing".into(),
                args: vec![7],
            })
        );
    }

    #[test]
    fn test_notify_wire_shape() {
        let frame = ServerFrame::Push(PushFrame::Notify(NotifyFrame {
            doc: "thing".into(),
            doc_id: 1,
            op: ChangeOp::Upsert,
            collection: Some("items".into()),
            parent_ids: Some(vec![]),
            data: json!({"id": 5}),
            cursor: None,
            has_more: None,
        }));
        let text = frame.encode().unwrap();
        assert!(text.contains("\"type\":\"notify\""));
        assert!(text.contains("\"op\":\"upsert\""));
        assert!(!text.contains("cursor"));
        assert_eq!(ServerFrame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_notify_page_fields() {
        let text = r#"{"type":"notify","doc":"posts","doc_id":0,"op":"set","data":{"posts":[]},"cursor":"c1","hasMore":true}"#;
        match ServerFrame::decode(text).unwrap() {
            ServerFrame::Push(PushFrame::Notify(n)) => {
                assert_eq!(n.cursor.as_deref(), Some("c1"));
                assert_eq!(n.has_more, Some(true));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_response_shapes() {
        let ok = ResponseFrame::success(1, json!({"x": 1}));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"ok\":true"));
        assert!(!text.contains("error"));

        let err = ResponseFrame::failure(2, "permission denied");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"ok\":false"));
        assert!(!text.contains("data"));

        // A response has no type tag but still decodes as a server frame.
        match ServerFrame::decode(&text).unwrap() {
            ServerFrame::Response(r) => {
                assert_eq!(r.id, 2);
                assert_eq!(r.error.as_deref(), Some("permission denied"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_error_push_uses_fn_key() {
        let frame = ServerFrame::Push(PushFrame::Error {
            function: "thing".into(),
            doc_id: 7,
            error: "permission denied".into(),
        });
        let text = frame.encode().unwrap();
        assert!(text.contains("\"fn\":\"thing\""));
        assert_eq!(ServerFrame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_request_id_recovery() {
        assert_eq!(request_id(r#"{"id":9,"fn":"x","args":"bogus"}"#), Some(9));
        assert_eq!(request_id(r#"{"fn":"x"}"#), None);
        assert_eq!(request_id("not json"), None);
    }
}
