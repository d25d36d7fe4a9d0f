//! Boundary types shared between the level bridge and its embedding engine.
//!
//! The engine talks to the bridge through a small, fixed set of shapes:
//! typed observation specs, event views pointing at bridge-owned storage and
//! a flat spawn-var buffer for entity dictionaries. Keeping them in one crate
//! lets the engine side depend on the layout without pulling in the script
//! runtime.

mod spawn_vars;

use std::convert::TryFrom;

use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

pub use spawn_vars::{EntityInstance, SpawnVarsBuffer};

/// Maximum number of key/value pairs a single entity may carry.
pub const MAX_SPAWN_VARS: usize = 64;

/// Maximum number of chars (including NUL terminators) in one spawn-var buffer.
pub const MAX_SPAWN_VARS_CHARS: usize = 4096;

/// Maximum length of any string field of a pickup item.
pub const MAX_PICKUP_STRING_CHARS: usize = 1024;

/// Entity flag bit marking an entity that is not drawn.
pub const ENTITY_FLAG_NODRAW: i32 = 0x0000_0080;

/// Element type of an observation or event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(i32)]
pub enum ObservationType {
    Bytes = 0,
    Doubles = 1,
    String = 2,
}

impl ObservationType {
    /// Parse the script-facing type name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Bytes" => Some(Self::Bytes),
            "Doubles" => Some(Self::Doubles),
            "String" => Some(Self::String),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bytes => "Bytes",
            Self::Doubles => "Doubles",
            Self::String => "String",
        }
    }
}

impl TryFrom<i32> for ObservationType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bytes),
            1 => Ok(Self::Doubles),
            2 => Ok(Self::String),
            other => Err(WireError::UnknownObservationType(other)),
        }
    }
}

/// Type and shape of an observation. `shape` is empty when the shape varies
/// per call and must be read from each payload's own spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ObservationSpec<'a> {
    #[serde(rename = "type")]
    pub kind: ObservationType,
    pub shape: &'a [i32],
}

impl<'a> ObservationSpec<'a> {
    pub fn new(kind: ObservationType, shape: &'a [i32]) -> Self {
        Self { kind, shape }
    }

    pub fn dims(&self) -> usize {
        self.shape.len()
    }
}

/// Payload of one exported event observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload<'a> {
    Bytes(&'a [u8]),
    Doubles(&'a [f64]),
    String(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EventObservation<'a> {
    pub spec: ObservationSpec<'a>,
    pub payload: EventPayload<'a>,
}

/// Export view of a single event occurrence. Borrows the registry's storage,
/// so it cannot outlive the next mutating call on the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView<'a> {
    pub type_id: usize,
    pub observations: Vec<EventObservation<'a>>,
}

/// Error conditions raised while crossing the boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("entity has {count} spawn vars; at most {max} are supported")]
    TooManySpawnVars { count: usize, max: usize },
    #[error("spawn vars need {needed} chars; at most {max} are supported")]
    TooManySpawnVarChars { needed: usize, max: usize },
    #[error("spawn var {0:?} contains an embedded NUL")]
    EmbeddedNul(String),
    #[error("spawn var offset {offset} is outside the {len}-char buffer")]
    OffsetOutOfRange { offset: usize, len: usize },
    #[error("spawn var at offset {0} is not NUL-terminated")]
    Unterminated(usize),
    #[error("spawn var at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("observation type {0} is unknown")]
    UnknownObservationType(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_type_names_parse() {
        assert_eq!(
            ObservationType::from_name("Doubles"),
            Some(ObservationType::Doubles)
        );
        assert_eq!(ObservationType::from_name("doubles"), None);
        assert_eq!(ObservationType::Bytes.as_str(), "Bytes");
    }

    #[test]
    fn observation_type_from_raw_rejects_unknown_tags() {
        assert_eq!(ObservationType::try_from(2), Ok(ObservationType::String));
        assert_eq!(
            ObservationType::try_from(7),
            Err(WireError::UnknownObservationType(7))
        );
    }

    #[test]
    fn spec_reports_dims_from_shape() {
        let shape = [4, 3];
        let spec = ObservationSpec::new(ObservationType::Bytes, &shape);
        assert_eq!(spec.dims(), 2);
        let varying = ObservationSpec::new(ObservationType::Doubles, &[]);
        assert_eq!(varying.dims(), 0);
    }
}
