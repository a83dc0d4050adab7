//! Wire protocol types shared by the controller bridge and the host peer.
//!
//! Both directions use the same framing: one JSON object per text frame.
//! - **Request**: controller -> host, `{id, command, params}`
//! - **Response**: host -> controller, `{id, ok, changed, data?, artifacts?, warnings?, error?}`

use serde::{Deserialize, Serialize};

/// Correlation id of one request.
///
/// Generated by the sending bridge from a monotonic counter and formatted as a
/// string so the wire format stays type-agnostic. Only unique within the
/// lifetime of one bridge instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_sequence(n: u64) -> Self {
        Self(format!("req_{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one connection incarnation held by a bridge.
///
/// UUID v4 so a replacement connection can never be confused with the one it
/// evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation request sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    /// Dot-namespaced operation name, e.g. `layer.set_opacity`. Opaque to the bridge.
    pub command: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Request {
    pub fn new(id: RequestId, command: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id,
            command: command.into(),
            params,
        }
    }
}

/// References to host objects created or touched by an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_ref: Option<String>,
}

/// Reply to exactly one [`Request`], echoing its id.
///
/// `ok = false` is a logical failure, not a transport failure. `changed` reports
/// whether host state was mutated and may be true even when `ok` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub ok: bool,
    #[serde(default)]
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Artifacts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: RequestId, changed: bool, data: Option<serde_json::Value>) -> Self {
        Self {
            id,
            ok: true,
            changed,
            data,
            artifacts: None,
            warnings: None,
            error: None,
        }
    }

    pub fn failure(id: RequestId, changed: bool, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            changed,
            data: None,
            artifacts: None,
            warnings: None,
            error: Some(error.into()),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        if !warnings.is_empty() {
            self.warnings = Some(warnings);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_from_sequence() {
        assert_eq!(RequestId::from_sequence(17).as_str(), "req_17");
    }

    #[test]
    fn request_serializes() {
        let req = Request::new(
            RequestId::from_sequence(17),
            "layer.set_opacity",
            json!({"layerId": 5, "opacity": 50}),
        );
        insta::assert_json_snapshot!(req, @r#"
        {
          "id": "req_17",
          "command": "layer.set_opacity",
          "params": {
            "layerId": 5,
            "opacity": 50
          }
        }
        "#);
    }

    #[test]
    fn success_response_serializes_without_empty_fields() {
        let resp = Response::success(
            RequestId::new("req_17"),
            true,
            Some(json!({"layerId": 5, "opacity": 50})),
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "req_17",
          "ok": true,
          "changed": true,
          "data": {
            "layerId": 5,
            "opacity": 50
          }
        }
        "#);
    }

    #[test]
    fn failure_response_serializes() {
        let resp = Response::failure(
            RequestId::new("req_17"),
            false,
            "layerId and opacity are required",
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "req_17",
          "ok": false,
          "changed": false,
          "error": "layerId and opacity are required"
        }
        "#);
    }

    #[test]
    fn artifacts_use_camel_case() {
        let resp = Response::success(RequestId::new("req_3"), true, None).with_artifacts(
            Artifacts {
                layer_ids: Some(vec![4, 9]),
                selection_ref: Some("sel_1".to_string()),
            },
        );
        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "req_3",
          "ok": true,
          "changed": true,
          "artifacts": {
            "layerIds": [
              4,
              9
            ],
            "selectionRef": "sel_1"
          }
        }
        "#);
    }

    #[test]
    fn empty_warnings_are_omitted() {
        let resp = Response::success(RequestId::new("req_1"), false, None).with_warnings(vec![]);
        assert!(resp.warnings.is_none());
    }

    #[test]
    fn response_defaults_changed_when_missing() {
        let resp: Response = serde_json::from_value(json!({"id": "req_2", "ok": true})).unwrap();
        assert!(!resp.changed);
        assert!(resp.data.is_none());
    }

    #[test]
    fn failed_response_may_report_changed() {
        let resp: Response = serde_json::from_value(json!({
            "id": "req_9",
            "ok": false,
            "changed": true,
            "error": "partially applied",
            "warnings": ["layer 3 was locked"]
        }))
        .unwrap();
        assert!(!resp.ok);
        assert!(resp.changed);
        assert_eq!(resp.warnings, Some(vec!["layer 3 was locked".to_string()]));
    }

    #[test]
    fn request_without_params_gets_empty_object() {
        let req: Request =
            serde_json::from_value(json!({"id": "req_4", "command": "document.info"})).unwrap();
        assert_eq!(req.params, json!({}));
    }

    #[test]
    fn connection_ids_are_distinct() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
