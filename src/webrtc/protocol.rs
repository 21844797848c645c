//! Binary data-channel protocol
//!
//! Every message starts with a one-byte id followed by little-endian
//! fixed-width fields. Strings are UTF-16LE: `string` carries a `u16`
//! length prefix, `only_string` runs to the end of the message.
//!
//! The streamer may replace the default tables by sending a `Protocol`
//! message whose payload is a JSON document:
//!
//! ```text
//! { "Direction": 0, "KeyDown": { "id": 60, "structure": ["uint8", "uint8"] }, ... }
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};

/// Field encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Uint8,
    Uint16,
    Int16,
    Float,
    Double,
    String,
    OnlyString,
}

impl FieldType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "uint8" => Some(Self::Uint8),
            "uint16" => Some(Self::Uint16),
            "int16" => Some(Self::Int16),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "string" => Some(Self::String),
            "only_string" => Some(Self::OnlyString),
            _ => None,
        }
    }
}

/// Value supplied for one field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Id and field layout of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefinition {
    pub id: u8,
    pub structure: Vec<FieldType>,
}

/// Direction tag of a `Protocol` document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToStreamer,
    FromStreamer,
}

impl Direction {
    fn from_value(value: &Value) -> Option<Self> {
        match value.as_u64()? {
            0 => Some(Self::ToStreamer),
            1 => Some(Self::FromStreamer),
            _ => None,
        }
    }
}

macro_rules! message_kinds {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $id:literal [$($field:ident),*]),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),*
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $(stringify!($variant) => Some($name::$variant),)*
                    _ => None,
                }
            }

            fn default_definition(&self) -> MessageDefinition {
                match self {
                    $($name::$variant => MessageDefinition {
                        id: $id,
                        structure: vec![$(FieldType::$field),*],
                    }),*
                }
            }
        }
    };
}

message_kinds! {
    /// Messages sent to the streamer
    ToStreamerMessage {
        IFrameRequest = 0 [],
        RequestQualityControl = 1 [],
        FpsRequest = 2 [],
        AverageBitrateRequest = 3 [],
        StartStreaming = 4 [],
        StopStreaming = 5 [],
        LatencyTest = 6 [String],
        RequestInitialSettings = 7 [],
        TestEcho = 8 [String],
        UIInteraction = 50 [String],
        Command = 51 [String],
        TextboxEntry = 52 [String],
        KeyDown = 60 [Uint8, Uint8],
        KeyUp = 61 [Uint8],
        KeyPress = 62 [Uint16],
        MouseEnter = 70 [],
        MouseLeave = 71 [],
        MouseDown = 72 [Uint8, Uint16, Uint16],
        MouseUp = 73 [Uint8, Uint16, Uint16],
        MouseMove = 74 [Uint16, Uint16, Int16, Int16],
        MouseWheel = 75 [Int16, Uint16, Uint16],
        MouseDouble = 76 [Uint8, Uint16, Uint16],
        TouchStart = 80 [Uint8, Uint16, Uint16, Uint8, Uint8, Uint8],
        TouchEnd = 81 [Uint8, Uint16, Uint16, Uint8, Uint8, Uint8],
        TouchMove = 82 [Uint8, Uint16, Uint16, Uint8, Uint8, Uint8],
        GamepadButtonPressed = 90 [Uint8, Uint8, Uint8],
        GamepadButtonReleased = 91 [Uint8, Uint8, Uint8],
        GamepadAnalog = 92 [Uint8, Uint8, Double],
        GamepadConnected = 93 [],
        GamepadDisconnected = 94 [Uint8],
    }
}

message_kinds! {
    /// Messages received from the streamer
    FromStreamerMessage {
        QualityControlOwnership = 0 [],
        Response = 1 [],
        Command = 2 [],
        FreezeFrame = 3 [],
        UnfreezeFrame = 4 [],
        VideoEncoderAvgQP = 5 [OnlyString],
        LatencyTest = 6 [],
        InitialSettings = 7 [OnlyString],
        FileExtension = 8 [],
        FileMimeType = 9 [],
        FileContents = 10 [],
        TestEcho = 11 [],
        InputControlOwnership = 12 [],
        GamepadResponse = 13 [],
        Protocol = 255 [OnlyString],
    }
}

/// These keep their local layout; some streamers send them without one
const PINNED_TO_STREAMER: [ToStreamerMessage; 3] = [
    ToStreamerMessage::UIInteraction,
    ToStreamerMessage::Command,
    ToStreamerMessage::LatencyTest,
];

/// A decoded message from the streamer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamerMessage {
    pub kind: FromStreamerMessage,
    /// Bytes after the id
    pub payload: Bytes,
}

impl StreamerMessage {
    /// Payload as UTF-16LE text
    pub fn text(&self) -> String {
        decode_utf16le(&self.payload)
    }

    /// First payload byte as a flag
    pub fn flag(&self) -> Option<bool> {
        self.payload.first().map(|b| *b != 0)
    }
}

/// Outcome of applying a `Protocol` document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolUpdate {
    pub direction: Direction,
    pub updated: usize,
    pub skipped: usize,
}

/// Message tables for both directions
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    to_streamer: HashMap<ToStreamerMessage, MessageDefinition>,
    from_streamer: HashMap<u8, FromStreamerMessage>,
}

impl Default for ProtocolTable {
    fn default() -> Self {
        let to_streamer = ToStreamerMessage::ALL
            .iter()
            .map(|kind| (*kind, kind.default_definition()))
            .collect();
        let from_streamer = FromStreamerMessage::ALL
            .iter()
            .map(|kind| (kind.default_definition().id, *kind))
            .collect();
        Self {
            to_streamer,
            from_streamer,
        }
    }
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition(&self, kind: ToStreamerMessage) -> Option<&MessageDefinition> {
        self.to_streamer.get(&kind)
    }

    /// Current id of an inbound message kind
    pub fn from_streamer_id(&self, kind: FromStreamerMessage) -> Option<u8> {
        self.from_streamer
            .iter()
            .find(|(_, k)| **k == kind)
            .map(|(id, _)| *id)
    }

    /// Encode a message for the streamer
    pub fn encode(&self, kind: ToStreamerMessage, values: &[FieldValue]) -> Result<Bytes> {
        let definition = self
            .to_streamer
            .get(&kind)
            .ok_or_else(|| AppError::protocol(kind.name(), "message is not in the protocol"))?;

        if values.len() != definition.structure.len() {
            return Err(AppError::protocol(
                kind.name(),
                format!(
                    "expected {} field(s), got {}",
                    definition.structure.len(),
                    values.len()
                ),
            ));
        }

        let mut buf = BytesMut::with_capacity(1 + 8 * values.len());
        buf.put_u8(definition.id);

        for (field, value) in definition.structure.iter().zip(values) {
            match (field, value) {
                (FieldType::Uint8, FieldValue::Number(n)) => buf.put_u8(*n as u8),
                (FieldType::Uint16, FieldValue::Number(n)) => buf.put_u16_le(*n as u16),
                (FieldType::Int16, FieldValue::Number(n)) => buf.put_i16_le(*n as i16),
                (FieldType::Float, FieldValue::Number(n)) => buf.put_f32_le(*n as f32),
                (FieldType::Double, FieldValue::Number(n)) => buf.put_f64_le(*n),
                (FieldType::String, FieldValue::Text(s)) => {
                    let units: Vec<u16> = s.encode_utf16().collect();
                    let len = u16::try_from(units.len()).map_err(|_| {
                        AppError::protocol(kind.name(), "string field longer than 65535 units")
                    })?;
                    buf.put_u16_le(len);
                    units.iter().for_each(|u| buf.put_u16_le(*u));
                }
                (FieldType::OnlyString, FieldValue::Text(s)) => {
                    s.encode_utf16().for_each(|u| buf.put_u16_le(u));
                }
                (field, value) => {
                    return Err(AppError::protocol(
                        kind.name(),
                        format!("value {:?} does not fit field {:?}", value, field),
                    ))
                }
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a message from the streamer
    pub fn decode(&self, data: &[u8]) -> Result<StreamerMessage> {
        let mut data = Bytes::copy_from_slice(data);
        if !data.has_remaining() {
            return Err(AppError::protocol("empty message", "no message id"));
        }
        let id = data.get_u8();
        let kind = self
            .from_streamer
            .get(&id)
            .copied()
            .ok_or_else(|| AppError::protocol(format!("message id {}", id), "unknown id"))?;
        Ok(StreamerMessage {
            kind,
            payload: data,
        })
    }

    /// Apply a `Protocol` document sent by the streamer
    pub fn apply_protocol_json(&mut self, json: &str) -> Result<ProtocolUpdate> {
        let document: Value = serde_json::from_str(json)?;
        let Value::Object(mut entries) = document else {
            return Err(AppError::protocol("Protocol", "document is not an object"));
        };

        let direction = entries
            .remove("Direction")
            .as_ref()
            .and_then(Direction::from_value)
            .ok_or_else(|| {
                AppError::protocol("Protocol", "missing or unknown Direction")
            })?;

        info!("Received new {:?} protocol. Updating existing protocol...", direction);

        let mut update = ProtocolUpdate {
            direction,
            updated: 0,
            skipped: 0,
        };

        for (name, entry) in &entries {
            let Some(id) = entry.get("id").and_then(Value::as_u64) else {
                error!("{:?}->{} definition has no id: {}", direction, name, entry);
                update.skipped += 1;
                continue;
            };
            let Ok(id) = u8::try_from(id) else {
                error!("{:?}->{} id {} does not fit in one byte", direction, name, id);
                update.skipped += 1;
                continue;
            };

            match direction {
                Direction::ToStreamer => {
                    let Some(kind) = ToStreamerMessage::from_name(name) else {
                        error!("No handler registered for ToStreamer message \"{}\"", name);
                        update.skipped += 1;
                        continue;
                    };
                    if PINNED_TO_STREAMER.contains(&kind) {
                        debug!("Keeping local definition of {}", name);
                        update.skipped += 1;
                        continue;
                    }

                    let structure = match entry.get("structure") {
                        Some(structure) => match parse_structure(structure) {
                            Some(structure) => structure,
                            None => {
                                error!("ToStreamer->{} has a malformed structure: {}", name, structure);
                                update.skipped += 1;
                                continue;
                            }
                        },
                        None => self
                            .to_streamer
                            .get(&kind)
                            .map(|d| d.structure.clone())
                            .unwrap_or_default(),
                    };
                    self.to_streamer.insert(kind, MessageDefinition { id, structure });
                }
                Direction::FromStreamer => {
                    let Some(kind) = FromStreamerMessage::from_name(name) else {
                        error!("No handler registered for FromStreamer message \"{}\"", name);
                        update.skipped += 1;
                        continue;
                    };
                    self.from_streamer.retain(|_, k| *k != kind);
                    self.from_streamer.insert(id, kind);
                }
            }
            update.updated += 1;
        }

        Ok(update)
    }
}

/// Accepts `["uint8", ...]` or `[{ "name": .., "type": "uint8" }, ...]`
fn parse_structure(value: &Value) -> Option<Vec<FieldType>> {
    value
        .as_array()?
        .iter()
        .map(|field| {
            let name = match field {
                Value::String(s) => s.as_str(),
                other => other.get("type")?.as_str()?,
            };
            FieldType::parse(name)
        })
        .collect()
}

/// Decode UTF-16LE; a trailing odd byte is ignored
pub fn decode_utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Encode a message id followed by UTF-16LE text
pub fn encode_utf16le(id: u8, text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 2 * text.len());
    buf.put_u8(id);
    text.encode_utf16().for_each(|u| buf.put_u16_le(u));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_mouse_move() {
        let table = ProtocolTable::new();
        let bytes = table
            .encode(
                ToStreamerMessage::MouseMove,
                &[100.into(), 200.into(), (-3).into(), 4.into()],
            )
            .unwrap();
        assert_eq!(&bytes[..], &[74, 100, 0, 200, 0, 0xfd, 0xff, 4, 0]);
    }

    #[test]
    fn test_encode_string_field() {
        let table = ProtocolTable::new();
        let bytes = table
            .encode(ToStreamerMessage::Command, &["{}".into()])
            .unwrap();
        assert_eq!(&bytes[..], &[51, 2, 0, b'{', 0, b'}', 0]);

        let empty = table
            .encode(ToStreamerMessage::RequestInitialSettings, &[])
            .unwrap();
        assert_eq!(&empty[..], &[7]);
    }

    #[test]
    fn test_encode_rejects_bad_arity_and_types() {
        let table = ProtocolTable::new();
        assert!(table.encode(ToStreamerMessage::KeyDown, &[1.into()]).is_err());
        assert!(table
            .encode(ToStreamerMessage::KeyUp, &["a".into()])
            .is_err());
    }

    #[test]
    fn test_decode_only_string() {
        let table = ProtocolTable::new();
        let message = table.decode(&encode_utf16le(5, "27")).unwrap();
        assert_eq!(message.kind, FromStreamerMessage::VideoEncoderAvgQP);
        assert_eq!(message.text(), "27");

        let ownership = table.decode(&[0, 1]).unwrap();
        assert_eq!(ownership.kind, FromStreamerMessage::QualityControlOwnership);
        assert_eq!(ownership.flag(), Some(true));

        assert!(table.decode(&[200]).is_err());
        assert!(table.decode(&[]).is_err());
    }

    #[test]
    fn test_apply_to_streamer_protocol() {
        let mut table = ProtocolTable::new();
        let update = table
            .apply_protocol_json(
                r#"{
                    "Direction": 0,
                    "KeyDown": { "id": 160, "structure": ["uint8", "uint8"] },
                    "MouseEnter": { "id": 170 },
                    "Command": { "id": 99 },
                    "NoId": { "structure": [] },
                    "MadeUp": { "id": 1 }
                }"#,
            )
            .unwrap();

        assert_eq!(update.direction, Direction::ToStreamer);
        assert_eq!(update.updated, 2);
        assert_eq!(update.skipped, 3);
        assert_eq!(table.definition(ToStreamerMessage::KeyDown).unwrap().id, 160);
        assert_eq!(table.definition(ToStreamerMessage::MouseEnter).unwrap().id, 170);
        // Pinned definition survives
        assert_eq!(table.definition(ToStreamerMessage::Command).unwrap().id, 51);
    }

    #[test]
    fn test_apply_from_streamer_protocol() {
        let mut table = ProtocolTable::new();
        table
            .apply_protocol_json(
                r#"{"Direction": 1, "InitialSettings": {"id": 42, "structure": [{"name": "value", "type": "only_string"}]}}"#,
            )
            .unwrap();

        assert_eq!(table.from_streamer_id(FromStreamerMessage::InitialSettings), Some(42));
        assert!(table.decode(&[7]).is_err());
        assert_eq!(
            table.decode(&[42]).unwrap().kind,
            FromStreamerMessage::InitialSettings
        );
    }

    #[test]
    fn test_apply_rejects_missing_direction() {
        let mut table = ProtocolTable::new();
        assert!(table.apply_protocol_json(r#"{"KeyDown": {"id": 1}}"#).is_err());
        assert!(table.apply_protocol_json("[]").is_err());
    }
}
