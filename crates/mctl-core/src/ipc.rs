use crate::pidfile::StopOutcome;
use crate::{MissionFilter, MissionPatch, MissionView, NewMission};
use chrono::Utc;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: Msg,
}

impl Envelope {
    pub fn new(request_id: Option<String>, msg: Msg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            request_id,
            timestamp: Utc::now().to_rfc3339(),
            msg,
        }
    }
}

/// Requests are keyed by path-like names; replies come back as `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Msg {
    #[serde(rename = "health")]
    Health(HealthQuery),
    #[serde(rename = "missions/list")]
    ListMissions(MissionFilter),
    #[serde(rename = "missions/get")]
    GetMission(MissionRef),
    #[serde(rename = "missions/create")]
    CreateMission(NewMission),
    #[serde(rename = "missions/update")]
    UpdateMission(UpdateMission),
    #[serde(rename = "missions/bind")]
    BindMission(BindMission),
    #[serde(rename = "missions/heartbeat")]
    Heartbeat(MissionRef),
    #[serde(rename = "missions/stop")]
    StopMission(MissionRef),
    #[serde(rename = "missions/archive")]
    ArchiveMission(MissionRef),
    #[serde(rename = "result")]
    Result(Reply),
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Health(_) => "health",
            Msg::ListMissions(_) => "missions/list",
            Msg::GetMission(_) => "missions/get",
            Msg::CreateMission(_) => "missions/create",
            Msg::UpdateMission(_) => "missions/update",
            Msg::BindMission(_) => "missions/bind",
            Msg::Heartbeat(_) => "missions/heartbeat",
            Msg::StopMission(_) => "missions/stop",
            Msg::ArchiveMission(_) => "missions/archive",
            Msg::Result(_) => "result",
            Msg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthQuery {
    #[serde(default)]
    pub client_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateMission {
    pub id: String,
    #[serde(flatten)]
    pub patch: MissionPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindMission {
    pub id: String,
    #[serde(default)]
    pub pane: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Health(HealthPayload),
    Missions(Vec<MissionView>),
    Mission(MissionView),
    Stopped(StopReport),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthPayload {
    pub status: String,
    pub version: String,
    pub pid: u32,
}

impl HealthPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopReport {
    pub id: String,
    pub outcome: StopOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Ambiguous,
    Archived,
    InvalidArgs,
    Storage,
    StopFailed,
    UnsupportedVersion,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Ambiguous => "ambiguous",
            ErrorCode::Archived => "archived",
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::Storage => "storage",
            ErrorCode::StopFailed => "stop_failed",
            ErrorCode::UnsupportedVersion => "unsupported_version",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_keyed_by_path() {
        let envelope = Envelope::new(
            Some("req-1".to_string()),
            Msg::ListMissions(MissionFilter {
                include_archived: true,
                cron_job: Some("nightly".to_string()),
            }),
        );
        let value = serde_json::to_value(&envelope).expect("to value");
        assert_eq!(value["type"], "missions/list");
        assert_eq!(value["version"], "1");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["payload"]["include_archived"], true);
        assert_eq!(value["payload"]["cron_job"], "nightly");
    }

    #[test]
    fn update_patch_is_flattened_and_partial() {
        let parsed: Envelope = serde_json::from_str(
            r#"{
                "type": "missions/update",
                "timestamp": "2026-10-17T09:00:00Z",
                "payload": {"id": "8c1f0b2e", "description": "triage flaky tests"}
            }"#,
        )
        .expect("parse update");
        let Msg::UpdateMission(update) = parsed.msg else {
            panic!("expected update request")
        };
        assert_eq!(update.id, "8c1f0b2e");
        assert_eq!(
            update.patch.description.as_deref(),
            Some("triage flaky tests")
        );
        assert!(update.patch.config_snapshot.is_none());
        assert_eq!(parsed.version, ProtocolVersion::CURRENT);
    }

    #[test]
    fn error_reply_carries_code() {
        let envelope = Envelope::new(
            None,
            Msg::Error(ErrorPayload::new(ErrorCode::NotFound, "no such mission")),
        );
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(frame.ends_with(b"\n"));
        let text = String::from_utf8(frame.clone()).expect("utf8");
        assert!(text.contains(r#""code":"not_found""#));
        let decoded: Envelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        for raw in [
            r#"{"version":"1","type":"health","timestamp":"t","payload":{}}"#,
            r#"{"version":1,"type":"health","timestamp":"t","payload":{}}"#,
            r#"{"type":"health","timestamp":"t","payload":{}}"#,
        ] {
            let parsed: Envelope = serde_json::from_str(raw).expect("parse health");
            assert_eq!(parsed.version, ProtocolVersion(1));
            assert!(matches!(parsed.msg, Msg::Health(_)));
        }
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let envelope = Envelope::new(
            None,
            Msg::UpdateMission(UpdateMission {
                id: "8c1f0b2e".to_string(),
                patch: MissionPatch {
                    description: Some("x".repeat(256)),
                    config_snapshot: None,
                },
            }),
        );
        assert!(matches!(
            encode_frame(&envelope, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let decoded = decode_frame::<Envelope>(&frame, 64);
        assert!(matches!(decoded, Err(FrameError::OversizedFrame { .. })));
    }
}
