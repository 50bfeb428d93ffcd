//! Operation lifecycle types shared by both sides of the protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle label of an operation.
///
/// `Running` is the only non-terminal state; the other three are terminal.
/// The wire (state headers, JSON bodies) uses the lowercase form.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[derive(Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationState {
    /// The operation has not yet reached a terminal state.
    Running,
    /// The operation completed successfully.
    Succeeded,
    /// The operation completed unsuccessfully.
    Failed,
    /// The operation was canceled.
    Canceled,
}

impl OperationState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Status record for an operation, returned from async-start (201) and
/// get-info responses.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    /// The handler-minted operation token. Opaque to the caller.
    ///
    /// Decoding accepts `"id"` as a legacy synonym for one migration
    /// window; encoding always emits `"token"`.
    #[serde(alias = "id")]
    pub token: String,
    /// Current lifecycle state.
    pub state: OperationState,
    /// When the operation started, if the handler tracks it.
    #[serde(
        default,
        rename = "startTime",
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub start_time: Option<OffsetDateTime>,
}

impl fmt::Display for OperationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = &self.token;
        let state = &self.state;
        write!(f, "operation {token} ({state})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_wire_form_is_lowercase() {
        assert_eq!(OperationState::Running.to_string(), "running");
        assert_eq!(OperationState::Succeeded.to_string(), "succeeded");
        assert_eq!(OperationState::Failed.to_string(), "failed");
        assert_eq!(OperationState::Canceled.to_string(), "canceled");

        let state: OperationState = "canceled".parse().unwrap();
        assert_eq!(state, OperationState::Canceled);
        assert!("CANCELED".parse::<OperationState>().is_err());
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!OperationState::Running.is_terminal());
        assert!(OperationState::Succeeded.is_terminal());
        assert!(OperationState::Failed.is_terminal());
        assert!(OperationState::Canceled.is_terminal());
    }

    #[test]
    fn info_wire_shape() {
        let info = OperationInfo {
            token: "op-1".to_owned(),
            state: OperationState::Running,
            start_time: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"token":"op-1","state":"running"}"#);
    }

    /// Older peers send `"id"` instead of `"token"`.
    #[test]
    fn info_accepts_legacy_id_field() {
        let info: OperationInfo =
            serde_json::from_str(r#"{"id":"legacy","state":"running"}"#)
                .unwrap();
        assert_eq!(info.token, "legacy");
    }

    #[test]
    fn info_start_time_roundtrip() {
        let info = OperationInfo {
            token: "op-2".to_owned(),
            state: OperationState::Succeeded,
            start_time: Some(OffsetDateTime::UNIX_EPOCH),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(r#""startTime":"1970-01-01T00:00:00Z""#));
        let decoded: OperationInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, info);
    }
}
