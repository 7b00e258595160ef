//! Interactive session wire contract
//!
//! Client -> server control frames, server -> client event frames, and the
//! monitor mirror frames fanned out to supervising observers.

use serde::{Deserialize, Serialize};

/// Connection identity, resolved by the (out-of-scope) auth boundary
#[derive(Debug, Clone)]
pub struct Identity {
    /// Display identifier used in monitor frames
    pub user_id: String,
    /// Database id; `None` for anonymous connections (no records kept)
    pub db_id: Option<i64>,
    pub role: Role,
    pub name: String,
}

impl Identity {
    pub fn anonymous() -> Self {
        Identity {
            user_id: "anon".to_string(),
            db_id: None,
            role: Role::Guest,
            name: "Anonymous".to_string(),
        }
    }
}

/// Connection role; monitor status is derived from it at registration
/// time and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Teacher,
    Admin,
    Guest,
}

impl Role {
    /// Teachers and admins mirror all live output
    pub fn is_monitor(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STUDENT" => Ok(Role::Student),
            "TEACHER" => Ok(Role::Teacher),
            "ADMIN" => Ok(Role::Admin),
            _ => Ok(Role::Guest),
        }
    }
}

/// Inbound control frame
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Write bytes to the attached pseudo-terminal
    Input {
        #[serde(default)]
        payload: String,
    },
    /// Propagate new terminal geometry
    Resize { rows: u16, cols: u16 },
    /// Kill any running program, then compile and attach a new one
    RunCode {
        #[serde(default)]
        payload: String,
        #[serde(default, rename = "exerciseId")]
        exercise_id: Option<i64>,
    },
    /// Forcibly kill the attached program
    Stop,
}

/// Typed server -> client event frame (terminal output itself is sent as
/// plain bytes, not wrapped)
#[derive(Debug, Clone, Serialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: String,
}

/// Payload of an `ai_analysis` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub status: String,
    pub content: String,
}

impl EventFrame {
    /// The attached program is no longer running.
    pub fn status_stopped() -> Self {
        EventFrame {
            kind: "status",
            payload: "stopped".to_string(),
        }
    }

    /// Critique text for the side panel.
    pub fn ai_analysis(status: &str, content: &str) -> Self {
        let payload = AnalysisPayload {
            status: status.to_string(),
            content: content.to_string(),
        };
        EventFrame {
            kind: "ai_analysis",
            // Nested encoding mirrors the frontend contract
            payload: serde_json::to_string(&payload).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frame mirrored to monitors, tagged with sender identity and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorFrame {
    #[serde(rename = "type")]
    pub kind: MonitorEvent,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub payload: String,
    pub timestamp: String,
}

/// Monitor frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorEvent {
    CompileStart,
    OutputChunk,
    CompileEnd,
}

impl MonitorFrame {
    pub fn new(kind: MonitorEvent, identity: &Identity, payload: impl Into<String>) -> Self {
        MonitorFrame {
            kind,
            user_id: identity.user_id.clone(),
            user_name: identity.name.clone(),
            payload: payload.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_parsing() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"input","payload":"ls\n"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Input { payload } if payload == "ls\n"));

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Resize { rows: 40, cols: 120 }));

        let msg: ControlMessage = serde_json::from_str(
            r#"{"type":"run_code","payload":"int main(){}","exerciseId":7}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::RunCode {
                payload,
                exercise_id,
            } => {
                assert_eq!(payload, "int main(){}");
                assert_eq!(exercise_id, Some(7));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ControlMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(matches!(msg, ControlMessage::Stop));
    }

    #[test]
    fn test_malformed_control_message_is_an_error_not_a_panic() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>("not json").is_err());
    }

    #[test]
    fn test_monitor_frame_shape() {
        let identity = Identity {
            user_id: "42".to_string(),
            db_id: Some(42),
            role: Role::Student,
            name: "Ada".to_string(),
        };
        let frame = MonitorFrame::new(MonitorEvent::OutputChunk, &identity, "hello");
        let json = frame.to_json();
        assert!(json.contains(r#""type":"output_chunk""#));
        assert!(json.contains(r#""userId":"42""#));
        assert!(json.contains(r#""userName":"Ada""#));
        assert!(json.contains("timestamp"));
    }

    #[test]
    fn test_ai_analysis_frame_nests_payload() {
        let frame = EventFrame::ai_analysis("success", "## Summary\nok");
        let json = frame.to_json();
        assert!(json.contains(r#""type":"ai_analysis""#));
        let outer: serde_json::Value = serde_json::from_str(&json).unwrap();
        let inner: AnalysisPayload =
            serde_json::from_str(outer["payload"].as_str().unwrap()).unwrap();
        assert_eq!(inner.status, "success");
    }

    #[test]
    fn test_role_monitor_derivation() {
        assert!(Role::Teacher.is_monitor());
        assert!(Role::Admin.is_monitor());
        assert!(!Role::Student.is_monitor());
        assert!(!Role::Guest.is_monitor());
        assert_eq!("teacher".parse::<Role>().unwrap(), Role::Teacher);
        assert_eq!("???".parse::<Role>().unwrap(), Role::Guest);
    }
}
