use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// Hub state value that maps to `true`; everything else is `false`.
pub const STATE_ON: &str = "on";

pub fn is_on(state: &str) -> bool {
    state == STATE_ON
}

/// One row of the hub's full state listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
}

/// Compressed entity state as carried by subscription events (`{"s": ...}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompressedState {
    #[serde(rename = "s", default)]
    pub state: Option<String>,
}

/// Changed fields of an entity (`{"+": {"s": ...}}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompressedDiff {
    #[serde(rename = "+", default)]
    pub additions: Option<CompressedState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventShape {
    /// Absolute snapshot: `{"a": {entity_id: {"s": state}}}`.
    AbsoluteSnapshot(HashMap<String, CompressedState>),
    /// Delta: `{"c": {entity_id: {"+": {"s": state}}}}`.
    DeltaChange(HashMap<String, CompressedDiff>),
}

impl EventShape {
    fn state_of(&self, entity_id: &str) -> Option<&str> {
        match self {
            EventShape::AbsoluteSnapshot(entities) => entities.get(entity_id)?.state.as_deref(),
            EventShape::DeltaChange(entities) => entities
                .get(entity_id)?
                .additions
                .as_ref()?
                .state
                .as_deref(),
        }
    }
}

/// A subscription event, split into the shapes it carried, in resolution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityEvent {
    shapes: Vec<EventShape>,
}

impl EntityEvent {
    pub fn new(shapes: Vec<EventShape>) -> Self {
        Self { shapes }
    }

    /// Inspect a raw event payload. Shapes that fail to decode are dropped
    /// rather than failing the whole event.
    pub fn from_value(payload: &Value) -> Self {
        let mut shapes = Vec::new();
        if let Some(raw) = payload.get("a") {
            if let Ok(entities) = serde_json::from_value(raw.clone()) {
                shapes.push(EventShape::AbsoluteSnapshot(entities));
            }
        }
        if let Some(raw) = payload.get("c") {
            if let Ok(entities) = serde_json::from_value(raw.clone()) {
                shapes.push(EventShape::DeltaChange(entities));
            }
        }
        Self { shapes }
    }

    pub fn shapes(&self) -> &[EventShape] {
        &self.shapes
    }

    /// New state string of `entity_id`, from the first shape that has one.
    pub fn resolve(&self, entity_id: &str) -> Option<&str> {
        self.shapes.iter().find_map(|shape| shape.state_of(entity_id))
    }

    pub fn resolve_on(&self, entity_id: &str) -> Option<bool> {
        self.resolve(entity_id).map(is_on)
    }
}

/// Hub entity ids the listener tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntities {
    pub power: String,
    pub art_mode: String,
}

impl TrackedEntities {
    pub fn ids(&self) -> Vec<String> {
        vec![self.power.clone(), self.art_mode.clone()]
    }
}
