//! Value types shared by every component.
//!
//! All of these cross component boundaries by value; nothing here holds a
//! reference into another component's state.

pub mod entity;
pub mod ids;
pub mod position;

use serde::{Deserialize, Serialize};

pub use entity::{Entity, EntityKind, Op, Payload, merge_payload};
pub use ids::{LOCAL_ID_PREFIX, LocalIdMinter, is_local_id};
pub use position::{PositionSample, SubjectId};

/// Last map viewport, persisted so a reopened client lands where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub center_lng: f64,
    pub center_lat: f64,
    pub zoom: f64,
}
