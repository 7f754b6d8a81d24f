//! Realtime wire messages.
//!
//! Every frame is `{"event": "<name>", "data": {...}}` with camelCase keys.
//! [`Inbound::decode`] is the only way server frames enter the engine, so
//! handlers downstream never see an unknown event or a non-finite fix.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::model::{Entity, PositionSample, SubjectId};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a valid message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("invalid {event}: {reason}")]
    Invalid { event: &'static str, reason: String },
}

impl ProtocolError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MalformedMessage
    }

    fn invalid(event: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            event,
            reason: reason.into(),
        }
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Outbound {
    #[serde(rename = "mission:join", rename_all = "camelCase")]
    MissionJoin { mission_id: String },

    #[serde(rename = "mission:snapshot:request", rename_all = "camelCase")]
    SnapshotRequest { mission_id: String },

    #[serde(rename = "position:update")]
    PositionUpdate(PositionSample),

    /// Backlog recorded while offline, oldest first.
    #[serde(rename = "position:bulk")]
    PositionBulk { points: Vec<PositionSample> },

    /// The local operator stopped sharing.
    #[serde(rename = "position:clear")]
    PositionClear {},
}

impl Outbound {
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::MissionJoin { .. } => "mission:join",
            Self::SnapshotRequest { .. } => "mission:snapshot:request",
            Self::PositionUpdate(_) => "position:update",
            Self::PositionBulk { .. } => "position:bulk",
            Self::PositionClear {} => "position:clear",
        }
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Server-side decoding, used by the simulator.
    ///
    /// # Errors
    ///
    /// Returns an error for frames that are not a known outbound message.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Authoritative peer state for one mission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub mission_id: String,
    #[serde(default)]
    pub positions: BTreeMap<SubjectId, PositionSample>,
    #[serde(default)]
    pub traces: BTreeMap<SubjectId, Vec<PositionSample>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<u64>,
}

/// A peer's live fix as fanned out by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPosition {
    pub user_id: String,
    #[serde(flatten)]
    pub sample: PositionSample,
}

/// Target of a `*:deleted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Inbound {
    #[serde(rename = "mission:snapshot")]
    Snapshot(SnapshotMessage),

    #[serde(rename = "position:update")]
    PositionUpdate(PeerPosition),

    #[serde(rename = "position:bulk", rename_all = "camelCase")]
    PositionBulk {
        user_id: String,
        points: Vec<PositionSample>,
    },

    #[serde(rename = "position:clear", rename_all = "camelCase")]
    PositionClear {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mission_id: Option<String>,
    },

    #[serde(rename = "poi:created")]
    PoiCreated(Entity),
    #[serde(rename = "poi:updated")]
    PoiUpdated(Entity),
    #[serde(rename = "poi:deleted")]
    PoiDeleted(EntityRef),
    #[serde(rename = "zone:created")]
    ZoneCreated(Entity),
    #[serde(rename = "zone:updated")]
    ZoneUpdated(Entity),
    #[serde(rename = "zone:deleted")]
    ZoneDeleted(EntityRef),

    #[serde(rename = "member:updated", rename_all = "camelCase")]
    MemberUpdated {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mission_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sharing_location: Option<bool>,
    },

    #[serde(rename = "mission:updated", rename_all = "camelCase")]
    MissionUpdated {
        mission_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retention_seconds: Option<u64>,
    },
}

/// Every inbound event name the engine understands.
pub const INBOUND_EVENTS: &[&str] = &[
    "mission:snapshot",
    "position:update",
    "position:bulk",
    "position:clear",
    "poi:created",
    "poi:updated",
    "poi:deleted",
    "zone:created",
    "zone:updated",
    "zone:deleted",
    "member:updated",
    "mission:updated",
];

impl Inbound {
    /// Parse and validate one server frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnknownEvent`] for unrecognized event names,
    /// [`ProtocolError::Malformed`] for shape errors, and
    /// [`ProtocolError::Invalid`] for well-shaped frames with unusable
    /// values (empty ids, non-finite live fixes).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid("frame", "missing event name"))?;
        if !INBOUND_EVENTS.contains(&event) {
            return Err(ProtocolError::UnknownEvent(event.to_string()));
        }
        let message: Self = serde_json::from_value(value)?;
        message.validate()?;
        Ok(message)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "mission:snapshot",
            Self::PositionUpdate(_) => "position:update",
            Self::PositionBulk { .. } => "position:bulk",
            Self::PositionClear { .. } => "position:clear",
            Self::PoiCreated(_) => "poi:created",
            Self::PoiUpdated(_) => "poi:updated",
            Self::PoiDeleted(_) => "poi:deleted",
            Self::ZoneCreated(_) => "zone:created",
            Self::ZoneUpdated(_) => "zone:updated",
            Self::ZoneDeleted(_) => "zone:deleted",
            Self::MemberUpdated { .. } => "member:updated",
            Self::MissionUpdated { .. } => "mission:updated",
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let event = self.event();
        match self {
            Self::Snapshot(snapshot) if snapshot.mission_id.is_empty() => {
                Err(ProtocolError::invalid(event, "empty missionId"))
            }
            Self::PositionUpdate(peer) => {
                if peer.user_id.is_empty() {
                    Err(ProtocolError::invalid(event, "empty userId"))
                } else if !peer.sample.is_well_formed() {
                    Err(ProtocolError::invalid(event, "non-finite coordinates"))
                } else {
                    Ok(())
                }
            }
            Self::PositionBulk { user_id, .. }
            | Self::PositionClear { user_id, .. }
            | Self::MemberUpdated { user_id, .. }
                if user_id.is_empty() =>
            {
                Err(ProtocolError::invalid(event, "empty userId"))
            }
            Self::PoiCreated(entity)
            | Self::PoiUpdated(entity)
            | Self::ZoneCreated(entity)
            | Self::ZoneUpdated(entity)
                if entity.id.is_empty() =>
            {
                Err(ProtocolError::invalid(event, "empty id"))
            }
            Self::PoiDeleted(target) | Self::ZoneDeleted(target) if target.id.is_empty() => {
                Err(ProtocolError::invalid(event, "empty id"))
            }
            Self::MissionUpdated { mission_id, .. } if mission_id.is_empty() => {
                Err(ProtocolError::invalid(event, "empty missionId"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frames_match_wire_names() {
        let join = Outbound::MissionJoin {
            mission_id: "m1".into(),
        };
        assert_eq!(
            serde_json::to_value(&join).expect("encode"),
            json!({"event": "mission:join", "data": {"missionId": "m1"}})
        );
        assert_eq!(
            serde_json::to_value(Outbound::PositionClear {}).expect("encode"),
            json!({"event": "position:clear", "data": {}})
        );
        let update = Outbound::PositionUpdate(PositionSample::new(1.0, 2.0, 3));
        assert_eq!(
            serde_json::to_value(&update).expect("encode"),
            json!({"event": "position:update", "data": {"lng": 1.0, "lat": 2.0, "t": 3}})
        );
        assert_eq!(Outbound::decode(&update.encode().expect("encode")).expect("decode"), update);
    }

    #[test]
    fn decodes_peer_position_with_flattened_fix() {
        let frame = r#"{"event":"position:update","data":{"userId":"bo","lng":7.1,"lat":46.2,"t":99,"speed":1.5}}"#;
        let Inbound::PositionUpdate(peer) = Inbound::decode(frame).expect("decode") else {
            panic!("wrong variant");
        };
        assert_eq!(peer.user_id, "bo");
        assert_eq!(peer.sample.t, 99);
        assert_eq!(peer.sample.speed, Some(1.5));
    }

    #[test]
    fn decodes_snapshot_with_missing_maps() {
        let frame = r#"{"event":"mission:snapshot","data":{"missionId":"m1","retentionSeconds":60}}"#;
        let Inbound::Snapshot(snapshot) = Inbound::decode(frame).expect("decode") else {
            panic!("wrong variant");
        };
        assert!(snapshot.traces.is_empty());
        assert_eq!(snapshot.retention_seconds, Some(60));
    }

    #[test]
    fn deleted_accepts_document_store_id() {
        let frame = r#"{"event":"zone:deleted","data":{"_id":"z9","missionId":"m1"}}"#;
        let message = Inbound::decode(frame).expect("decode");
        assert_eq!(
            message,
            Inbound::ZoneDeleted(EntityRef {
                id: "z9".into(),
                mission_id: Some("m1".into()),
            })
        );
    }

    #[test]
    fn rejects_unknown_events_and_bad_values() {
        assert!(matches!(
            Inbound::decode(r#"{"event":"chat:message","data":{}}"#),
            Err(ProtocolError::UnknownEvent(name)) if name == "chat:message"
        ));
        assert!(matches!(
            Inbound::decode(r#"{"event":"position:update","data":{"userId":"","lng":1,"lat":1,"t":1}}"#),
            Err(ProtocolError::Invalid { .. })
        ));
        assert!(matches!(
            Inbound::decode(r#"{"event":"position:update","data":{"userId":"bo","lng":"x","lat":1,"t":1}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(Inbound::decode("not json"), Err(ProtocolError::Malformed(_))));
        let err = Inbound::decode(r#"{"data":{}}"#).expect_err("no event");
        assert_eq!(err.code(), ErrorCode::MalformedMessage);
    }

    #[test]
    fn member_update_fields_are_optional() {
        let frame = r#"{"event":"member:updated","data":{"userId":"cy","sharingLocation":false}}"#;
        let message = Inbound::decode(frame).expect("decode");
        assert!(matches!(
            message,
            Inbound::MemberUpdated { sharing_location: Some(false), name: None, .. }
        ));
    }
}
