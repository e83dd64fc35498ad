//! JSON control messages sent by the consumer.
//!
//! Inbound: `{"action": "subscribe" | "unsubscribe", "paneIds": ["%0", ...]}`
//! Outbound: `{"type": "error", "message": "..."}`

use serde::{Deserialize, Serialize};

/// A parsed inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Valid JSON with an action we do not handle.
    Unknown(String),
}

/// Result of parsing one text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedControl {
    pub request: ControlRequest,
    /// Entries dropped from `paneIds` because they were empty strings.
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("malformed control message: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct RawControl {
    action: String,
    #[serde(rename = "paneIds", default)]
    pane_ids: Vec<String>,
}

/// Messages the hub sends on the text channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerNotice {
    Error { message: String },
}

impl ServerNotice {
    pub fn to_json(&self) -> String {
        // A two-field enum of strings always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":""}"#.into())
    }
}

impl From<&ControlError> for ServerNotice {
    fn from(err: &ControlError) -> Self {
        ServerNotice::Error {
            message: err.to_string(),
        }
    }
}

/// Parse one control message. Empty pane IDs are dropped individually
/// without failing the rest of the list.
pub fn parse_control(text: &str) -> Result<ParsedControl, ControlError> {
    let raw: RawControl =
        serde_json::from_str(text).map_err(|e| ControlError::Malformed(e.to_string()))?;

    let total = raw.pane_ids.len();
    let pane_ids: Vec<String> = raw.pane_ids.into_iter().filter(|id| !id.is_empty()).collect();
    let rejected = total - pane_ids.len();

    let request = match raw.action.as_str() {
        "subscribe" => ControlRequest::Subscribe(pane_ids),
        "unsubscribe" => ControlRequest::Unsubscribe(pane_ids),
        _ => ControlRequest::Unknown(raw.action),
    };
    Ok(ParsedControl { request, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_unsubscribe() {
        let parsed = parse_control(r#"{"action":"subscribe","paneIds":["%0","%1"]}"#).unwrap();
        assert_eq!(
            parsed.request,
            ControlRequest::Subscribe(vec!["%0".into(), "%1".into()])
        );
        assert_eq!(parsed.rejected, 0);

        let parsed = parse_control(r#"{"action":"unsubscribe","paneIds":["%0"]}"#).unwrap();
        assert_eq!(parsed.request, ControlRequest::Unsubscribe(vec!["%0".into()]));
    }

    #[test]
    fn empty_ids_rejected_individually() {
        let parsed = parse_control(r#"{"action":"subscribe","paneIds":["","%2",""]}"#).unwrap();
        assert_eq!(parsed.request, ControlRequest::Subscribe(vec!["%2".into()]));
        assert_eq!(parsed.rejected, 2);
    }

    #[test]
    fn missing_pane_ids_is_empty_list() {
        let parsed = parse_control(r#"{"action":"subscribe"}"#).unwrap();
        assert_eq!(parsed.request, ControlRequest::Subscribe(vec![]));
    }

    #[test]
    fn unknown_action_is_not_an_error() {
        let parsed = parse_control(r#"{"action":"resize","paneIds":["%0"]}"#).unwrap();
        assert_eq!(parsed.request, ControlRequest::Unknown("resize".into()));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_control("{not json").is_err());
        assert!(parse_control(r#"{"paneIds":["%0"]}"#).is_err());
        assert!(parse_control(r#"{"action":"subscribe","paneIds":[1]}"#).is_err());
    }

    #[test]
    fn error_notice_shape() {
        let err = ControlError::Malformed("eof".into());
        let json: serde_json::Value =
            serde_json::from_str(&ServerNotice::from(&err).to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "malformed control message: eof");
    }
}
