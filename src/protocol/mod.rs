use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RelayError, Result};

/// Operation kind for an outbound service call
pub const CALL_SERVICE_OP: &str = "call_service";

/// Operation kind the backend uses for service responses
pub const SERVICE_RESPONSE_OP: &str = "service_response";

/// Literal body returned to the caller when the deadline elapses with no
/// backend reply
pub const TIMEOUT_SENTINEL: &str = "false";

/// Inbound speech-detection request as the caller submits it
///
/// The `words`, `sentences` and `grammar` fields are JSON-encoded lists
/// transported as strings; they are decoded and validated before anything is
/// sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionRequest {
    /// Path of the uploaded audio file
    pub file_url: String,
    /// Recognition language code
    #[serde(default)]
    pub language: String,
    /// Audio capture source (e.g. "nao_wav_1_ch")
    #[serde(default)]
    pub audio_source: String,
    /// JSON-encoded list of words to search for
    #[serde(default = "empty_list")]
    pub words: String,
    /// JSON-encoded list of candidate sentences
    #[serde(default = "empty_list")]
    pub sentences: String,
    /// JSON-encoded grammar definition list
    #[serde(default = "empty_list")]
    pub grammar: String,
    /// Identifier of the calling user
    #[serde(default)]
    pub user: String,
}

fn empty_list() -> String {
    "[]".to_string()
}

/// Decode one of the JSON-encoded list parameters
///
/// Anything that does not parse as a list of strings is rejected before
/// backend contact.
pub fn decode_list(raw: &str, field: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| RelayError::InvalidInput(format!("{} is not a JSON string list: {}", field, e)))
}

/// Argument payload of an outbound recognition call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceArgs {
    /// Uniquified path of the audio asset
    pub path: String,
    pub audio_source: String,
    pub words: Vec<String>,
    pub sentences: Vec<String>,
    pub grammar: Vec<String>,
    pub language: String,
    pub user: String,
}

/// Outbound service-call envelope sent over the backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    /// Operation kind, always [`CALL_SERVICE_OP`]
    pub op: String,
    /// Target service path on the backend
    pub service: String,
    /// Recognition parameters
    pub args: ServiceArgs,
    /// Correlation identifier; the reply carries the same value
    pub id: String,
}

impl ServiceCall {
    /// Build a call envelope for the given service, arguments and identifier
    pub fn new(service: impl Into<String>, args: ServiceArgs, id: impl Into<String>) -> Self {
        Self {
            op: CALL_SERVICE_OP.to_string(),
            service: service.into(),
            args,
            id: id.into(),
        }
    }

    /// Serialize the call to its JSON wire form
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound reply envelope from the backend
///
/// Replies are matched to calls solely by `id` equality. Unknown envelope
/// fields are retained so a reply without a `values` payload can be returned
/// to the caller whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ServiceReply {
    /// Parse a reply from a raw text frame
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Extract the payload handed back to the caller: the `values` field when
    /// the backend sets one, otherwise the whole envelope
    pub fn into_payload(mut self) -> Value {
        if let Some(values) = self.values.take() {
            return values;
        }
        serde_json::to_value(&self).unwrap_or(Value::Null)
    }
}

/// Terminal outcome of one in-flight call, delivered to the caller exactly
/// once
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The backend answered; carries the reply payload
    Reply(Value),
    /// The deadline elapsed with no reply
    TimedOut,
    /// The backend connection dropped before a reply arrived
    Disconnected,
}

impl CallOutcome {
    /// Whether this outcome carries a backend reply
    pub fn is_reply(&self) -> bool {
        matches!(self, CallOutcome::Reply(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_list_valid() {
        let words = decode_list(r#"["yes","no"]"#, "words").unwrap();
        assert_eq!(words, vec!["yes".to_string(), "no".to_string()]);

        let empty = decode_list("[]", "grammar").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_decode_list_malformed() {
        assert!(decode_list("yes no", "words").is_err());
        assert!(decode_list(r#"{"a":1}"#, "words").is_err());
        assert!(decode_list(r#"[1,2,3]"#, "words").is_err());
        assert!(decode_list("", "words").is_err());
    }

    #[test]
    fn test_service_call_wire_form() {
        let args = ServiceArgs {
            path: "/tmp/speech.sessionab12c.wav".to_string(),
            audio_source: "nao_wav_1_ch".to_string(),
            words: vec!["yes".to_string()],
            sentences: vec![],
            grammar: vec![],
            language: "en".to_string(),
            user: "tester".to_string(),
        };
        let call = ServiceCall::new("/ric/speech_detection_sphinx4_batch", args, "ab12c");

        let wire: Value = serde_json::from_str(&call.to_wire().unwrap()).unwrap();
        assert_eq!(wire["op"], CALL_SERVICE_OP);
        assert_eq!(wire["service"], "/ric/speech_detection_sphinx4_batch");
        assert_eq!(wire["id"], "ab12c");
        assert_eq!(wire["args"]["path"], "/tmp/speech.sessionab12c.wav");
        assert_eq!(wire["args"]["words"][0], "yes");
    }

    #[test]
    fn test_reply_payload_from_values() {
        let reply = ServiceReply::parse(
            r#"{"op":"service_response","id":"ab12c","values":{"words":["yes"]},"result":true}"#,
        )
        .unwrap();

        assert_eq!(reply.id.as_deref(), Some("ab12c"));
        assert_eq!(reply.into_payload(), json!({"words":["yes"]}));
    }

    #[test]
    fn test_reply_payload_falls_back_to_envelope() {
        let reply = ServiceReply::parse(r#"{"id":"ab12c","status":"ok"}"#).unwrap();
        let payload = reply.into_payload();

        assert_eq!(payload["id"], "ab12c");
        assert_eq!(payload["status"], "ok");
    }

    #[test]
    fn test_request_defaults() {
        let request: RecognitionRequest =
            serde_json::from_str(r#"{"file_url":"/tmp/a.wav"}"#).unwrap();

        assert_eq!(request.words, "[]");
        assert_eq!(request.sentences, "[]");
        assert_eq!(request.grammar, "[]");
        assert!(request.language.is_empty());
    }
}
