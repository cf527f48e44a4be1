//! Map view of a message for script backends
//!
//! Scripts see a message as nested maps rooted at `HL7Message`:
//!
//! ```text
//! { "HL7Message": { "MSH": { "MSH.9": "123", ... },
//!                   "OBX": [ { "OBX.1": "1" }, { "OBX.1": "2" } ] },
//!   "metadata": ... }
//! ```
//!
//! A segment name that occurs once maps to a segment object; a repeated one
//! maps to an array of segment objects. Keys next to `HL7Message` are carried
//! as message extras.
//!
//! Segments a script adds are appended after the known ones in key order of
//! the view map, which is alphabetical: adding `ZZZ` and then `AAA` encodes
//! `AAA` first. Scripts that need a specific order for new segments should
//! add them one name at a time across steps or reuse names already present.

use super::{index_out_of_range, Field, Message, Segment, MAX_INDEX};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Root key of the message view
pub const MESSAGE_ROOT: &str = "HL7Message";

/// Errors converting a script view back into a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("message view must be a map")]
    NotAMap,

    #[error("message view has no `HL7Message` map")]
    MissingRoot,

    #[error("segment `{0}` must be a map or an array of maps")]
    BadSegment(String),

    #[error("field `{0}` must be a scalar or a map of components")]
    BadField(String),

    #[error("key `{key}` has an index above {max}")]
    IndexOutOfRange { key: String, max: usize },
}

fn check_index(key: &str, position: usize) -> Result<(), ViewError> {
    if index_out_of_range(key, position) {
        return Err(ViewError::IndexOutOfRange {
            key: key.to_string(),
            max: MAX_INDEX,
        });
    }
    Ok(())
}

impl Message {
    /// Whether `value` has the shape of a message view
    pub fn is_view(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|root| root.get(MESSAGE_ROOT))
            .is_some_and(Value::is_object)
    }

    /// Build the map view handed to scripts
    pub fn to_view(&self) -> Value {
        let mut groups: Map<String, Value> = Map::new();
        for name in self.segment_names() {
            if groups.contains_key(&name) {
                continue;
            }
            let mut occurrences: Vec<Value> = self.segments_named(&name).map(segment_view).collect();
            let value = if occurrences.len() == 1 {
                occurrences.remove(0)
            } else {
                Value::Array(occurrences)
            };
            groups.insert(name, value);
        }

        let mut root = Map::new();
        for (key, value) in self.extras() {
            root.insert(key.clone(), value.clone());
        }
        root.insert(MESSAGE_ROOT.to_string(), Value::Object(groups));
        Value::Object(root)
    }

    /// Rebuild a message from a (possibly script-modified) view
    ///
    /// `order_hint` is the segment order of the message the view was made
    /// from; segments named there keep their relative positions and any new
    /// segments are appended afterwards.
    pub fn from_view(view: &Value, order_hint: &[String]) -> Result<Message, ViewError> {
        let root = view.as_object().ok_or(ViewError::NotAMap)?;
        let groups = root
            .get(MESSAGE_ROOT)
            .and_then(Value::as_object)
            .ok_or(ViewError::MissingRoot)?;

        let mut pending: BTreeMap<String, VecDeque<Segment>> = BTreeMap::new();
        let mut fresh: Vec<String> = Vec::new();
        for (name, value) in groups {
            let segments = match value {
                Value::Null => continue,
                Value::Object(fields) => vec![segment_from_view(name, fields)?],
                Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_object()
                            .ok_or_else(|| ViewError::BadSegment(name.clone()))
                            .and_then(|fields| segment_from_view(name, fields))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(ViewError::BadSegment(name.clone())),
            };
            if !order_hint.contains(name) {
                fresh.push(name.clone());
            }
            pending.insert(name.clone(), segments.into());
        }

        let mut message = Message::new();
        for name in order_hint {
            if let Some(segment) = pending.get_mut(name).and_then(VecDeque::pop_front) {
                message.push_segment(segment);
            }
        }
        // Extra occurrences of known names, then names the script introduced
        for name in order_hint.iter().chain(fresh.iter()) {
            if let Some(rest) = pending.get_mut(name) {
                message.segments_mut().extend(rest.drain(..));
            }
        }

        for (key, value) in root {
            if key != MESSAGE_ROOT {
                message.extras_mut().insert(key.clone(), value.clone());
            }
        }

        Ok(message)
    }
}

fn segment_view(segment: &Segment) -> Value {
    let fields = segment
        .fields()
        .iter()
        .map(|(key, field)| {
            let value = match field {
                Field::Value(v) => Value::String(v.clone()),
                Field::Components(components) => Value::Object(
                    components
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            };
            (key.clone(), value)
        })
        .collect();
    Value::Object(fields)
}

fn segment_from_view(name: &str, fields: &Map<String, Value>) -> Result<Segment, ViewError> {
    let mut segment = Segment::new(name);
    for (key, value) in fields {
        check_index(key, 1)?;
        let field = match value {
            Value::Null => continue,
            Value::Object(components) => {
                for component in components.keys() {
                    check_index(component, 2)?;
                }
                Field::Components(
                    components
                        .iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| scalar_text(v).map(|text| (k.clone(), text)))
                        .collect::<Option<BTreeMap<_, _>>>()
                        .ok_or_else(|| ViewError::BadField(key.clone()))?,
                )
            }
            other => Field::Value(scalar_text(other).ok_or_else(|| ViewError::BadField(key.clone()))?),
        };
        segment.set_field_by_key(key.clone(), field);
    }
    Ok(segment)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
