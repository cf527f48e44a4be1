//! HL7 v2 codec
//!
//! Converts the delimited wire form (`\r` between segments, `|` between
//! fields, `^` between components) to an addressable [`Message`] tree and
//! back.
//!
//! ## Addressing
//!
//! Every field is stored under a synthetic key `<segment>.<index>` and every
//! component under `<field>.<component-index>`:
//!
//! ```text
//! PID|||1^^^MRN||Doe^Jane
//!
//! PID.0   = "PID"
//! PID.3   = { PID.3.1 = "1", PID.3.2 = "", PID.3.3 = "", PID.3.4 = "MRN" }
//! PID.5   = { PID.5.1 = "Doe", PID.5.2 = "Jane" }
//! ```
//!
//! Field 0 is the segment name itself, so `MSH.9` is the message control id
//! exactly as it is counted on the wire.
//!
//! ## Ordering
//!
//! Field and component order come from the numeric suffix of the key, never
//! from container order. Encoding emits every index from the lowest up to
//! the highest present one, filling gaps with empty strings. Keys without a
//! numeric suffix (for example `MSH.CustomField`) stay in the tree but are not
//! written to the wire, and neither are indices above [`MAX_INDEX`].
//!
//! ## Repeating segments
//!
//! Segments are kept as an ordered sequence, so a message with several `OBX`
//! segments keeps all of them in arrival order.

mod ack;
mod view;

pub use ack::{build_ack, build_ack_at, AckCode, ACK_TIMESTAMP_FORMAT};
pub use view::{ViewError, MESSAGE_ROOT};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Start-of-block byte (VT)
pub const START_BLOCK: u8 = 0x0B;

/// End-of-block byte (FS)
pub const END_BLOCK: u8 = 0x1C;

/// Trailer byte that follows the end-of-block byte (CR)
pub const TRAILER: u8 = 0x0D;

/// End-of-block byte followed by the trailer, as text
const FRAME_SUFFIX: &str = "\x1C\r";

/// Separator between segments
pub const SEGMENT_SEPARATOR: char = '\r';

/// Separator between fields of a segment
pub const FIELD_SEPARATOR: char = '|';

/// Separator between components of a field
pub const COMPONENT_SEPARATOR: char = '^';

/// Name of the header segment
pub const HEADER_SEGMENT: &str = "MSH";

/// Field index of the message control id within the header segment
pub const CONTROL_ID_FIELD: usize = 9;

/// Highest field or component index that reaches the wire
pub const MAX_INDEX: usize = 10_000;

/// Build the synthetic key for field `index` of `segment`
pub fn field_key(segment: &str, index: usize) -> String {
    format!("{}.{}", segment, index)
}

/// Build the synthetic key for component `index` (1-based) of a field key
pub fn component_key(field_key: &str, index: usize) -> String {
    format!("{}.{}", field_key, index)
}

/// Numeric suffix at position `position` of a dotted key, if any and within [`MAX_INDEX`]
fn key_index(key: &str, position: usize) -> Option<usize> {
    key.split('.')
        .nth(position)?
        .parse()
        .ok()
        .filter(|index| *index <= MAX_INDEX)
}

/// Whether the part at `position` is numeric but above [`MAX_INDEX`]
fn index_out_of_range(key: &str, position: usize) -> bool {
    key.split('.').nth(position).is_some_and(|part| {
        !part.is_empty()
            && part.bytes().all(|b| b.is_ascii_digit())
            && part.parse::<usize>().map_or(true, |index| index > MAX_INDEX)
    })
}

/// A single field value: either a scalar or a set of components
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Value(String),
    Components(BTreeMap<String, String>),
}

impl Field {
    /// Render the field as it appears on the wire
    pub fn to_wire(&self) -> String {
        match self {
            Field::Value(value) => value.clone(),
            Field::Components(components) => {
                let max = components
                    .keys()
                    .filter_map(|key| key_index(key, 2))
                    .max()
                    .unwrap_or(0);

                let mut parts = vec![""; max];
                for (key, value) in components {
                    if let Some(j) = key_index(key, 2).filter(|j| *j >= 1) {
                        parts[j - 1] = value.as_str();
                    }
                }
                parts.join(&COMPONENT_SEPARATOR.to_string())
            }
        }
    }

    /// Scalar value, if this field has no components
    pub fn as_value(&self) -> Option<&str> {
        match self {
            Field::Value(value) => Some(value),
            Field::Components(_) => None,
        }
    }

    /// Component at a 1-based index, given the owning field key
    pub fn component(&self, field_key: &str, index: usize) -> Option<&str> {
        match self {
            Field::Value(value) if index == 1 => Some(value),
            Field::Value(_) => None,
            Field::Components(components) => components
                .get(&component_key(field_key, index))
                .map(String::as_str),
        }
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Value(value.to_string())
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Value(value)
    }
}

/// A named segment with its fields keyed by synthetic field key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    name: String,
    fields: BTreeMap<String, Field>,
}

impl Segment {
    /// Create an empty segment
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Create a segment from already-keyed fields
    pub fn with_fields(name: impl Into<String>, fields: BTreeMap<String, Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &BTreeMap<String, Field> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, Field> {
        &mut self.fields
    }

    /// Field by position
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(&field_key(&self.name, index))
    }

    /// Field by synthetic key (`PID.5`, `MSH.CustomField`, ...)
    pub fn field_by_key(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Set a field by position
    pub fn set_field(&mut self, index: usize, field: impl Into<Field>) {
        let key = field_key(&self.name, index);
        self.fields.insert(key, field.into());
    }

    /// Set a field by synthetic key
    pub fn set_field_by_key(&mut self, key: impl Into<String>, field: impl Into<Field>) {
        self.fields.insert(key.into(), field.into());
    }

    /// Highest numeric field index present
    pub fn max_field_index(&self) -> usize {
        self.fields
            .keys()
            .filter_map(|key| key_index(key, 1))
            .max()
            .unwrap_or(0)
    }

    /// Render the segment as one wire line
    pub fn to_wire(&self) -> String {
        (0..=self.max_field_index())
            .map(|i| match self.field(i) {
                Some(field) => field.to_wire(),
                None if i == 0 => self.name.clone(),
                None => String::new(),
            })
            .collect::<Vec<_>>()
            .join(&FIELD_SEPARATOR.to_string())
    }

    /// Parse one wire line into a segment
    pub fn from_wire(line: &str) -> Self {
        let name: String = line.chars().take(3).collect();
        let mut segment = Segment::new(name.clone());

        for (i, value) in line.split(FIELD_SEPARATOR).enumerate() {
            let key = field_key(&name, i);
            let field = if value.contains(COMPONENT_SEPARATOR) {
                let components = value
                    .split(COMPONENT_SEPARATOR)
                    .enumerate()
                    .map(|(j, component)| (component_key(&key, j + 1), component.to_string()))
                    .collect();
                Field::Components(components)
            } else {
                Field::Value(value.to_string())
            };
            segment.fields.insert(key, field);
        }

        segment
    }
}

/// A decoded HL7 message
///
/// Segments keep the order in which they were decoded or pushed. Keys a
/// script adds next to the segment root (for example `msg.metadata`) are kept
/// in `extras` and never reach the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extras: BTreeMap<String, serde_json::Value>,
}

impl Message {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut Vec<Segment> {
        &mut self.segments
    }

    /// Append a segment at the end of the message
    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// First segment with the given name
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// First segment with the given name, mutably
    pub fn segment_mut(&mut self, name: &str) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.name == name)
    }

    /// All segments with the given name, in message order
    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name == name)
    }

    pub fn has_segment(&self, name: &str) -> bool {
        self.segment(name).is_some()
    }

    /// Segment names in message order, repeats included
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn extras(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extras
    }

    pub fn extras_mut(&mut self) -> &mut BTreeMap<String, serde_json::Value> {
        &mut self.extras
    }

    /// Wire text of a field addressed as `SEG.n` or a component as `SEG.n.m`
    pub fn get(&self, path: &str) -> Option<String> {
        let mut parts = path.splitn(3, '.');
        let name = parts.next()?;
        let index: usize = parts.next()?.parse().ok()?;
        let field = self.segment(name)?.field(index)?;

        match parts.next() {
            None => Some(field.to_wire()),
            Some(component) => {
                let component: usize = component.parse().ok()?;
                field
                    .component(&field_key(name, index), component)
                    .map(str::to_string)
            }
        }
    }

    /// Message control id (MSH-10 on the wire, `MSH.9` here)
    pub fn control_id(&self) -> Option<String> {
        self.get(&field_key(HEADER_SEGMENT, CONTROL_ID_FIELD))
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

/// Decode wire text into a message
///
/// Decoding is best effort and never fails: blank segments are dropped and
/// any framing bytes left around the payload are stripped first. A stray `\n`
/// after each `\r` is tolerated.
pub fn decode(wire: &str) -> Message {
    let text = remove_framing(wire);
    let mut message = Message::new();

    for line in text.split(SEGMENT_SEPARATOR) {
        let line = line.trim_start_matches('\n');
        if line.trim().is_empty() {
            continue;
        }
        message.push_segment(Segment::from_wire(line));
    }

    message
}

/// Encode a message into wire text
pub fn encode(message: &Message) -> String {
    message
        .segments
        .iter()
        .map(Segment::to_wire)
        .collect::<Vec<_>>()
        .join(&SEGMENT_SEPARATOR.to_string())
}

/// Wrap text in MLLP framing bytes
pub fn add_framing(text: &str) -> String {
    let mut framed = String::with_capacity(text.len() + 3);
    framed.push(START_BLOCK as char);
    framed.push_str(text);
    framed.push(END_BLOCK as char);
    framed.push(TRAILER as char);
    framed
}

/// Strip one leading start byte and one trailing end/trailer pair, if present
pub fn remove_framing(text: &str) -> &str {
    let text = text.strip_prefix(START_BLOCK as char).unwrap_or(text);
    text.strip_suffix(FRAME_SUFFIX).unwrap_or(text)
}

/// Control id read straight from wire text without a full decode
pub fn extract_control_id(wire: &str) -> Option<String> {
    remove_framing(wire)
        .split(SEGMENT_SEPARATOR)
        .map(|line| line.trim_start_matches('\n'))
        .find(|line| line.starts_with("MSH|"))
        .and_then(|line| line.split(FIELD_SEPARATOR).nth(CONTROL_ID_FIELD))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
