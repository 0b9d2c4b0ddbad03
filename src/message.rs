//! Wire schema shared by the coordinator and sources
//!
//! Every frame on the wire is one [`Message`]. Enum discriminants are part of
//! the wire contract and must never be renumbered; `ObjectType::DynamicList`
//! keeps its large sentinel value so new scalar types can be appended without
//! colliding with it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a [`Message`] frame. Stable numeric wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum MessageType {
    Register,
    Unregister,
    UpdateObjects,
    Set,
    Get,
    List,
    AddRow,
    DeleteRow,
    Ack,
    Nack,
    Ping,
}

impl From<MessageType> for u32 {
    fn from(value: MessageType) -> u32 {
        match value {
            MessageType::Register => 0,
            MessageType::Unregister => 1,
            MessageType::UpdateObjects => 2,
            MessageType::Set => 3,
            MessageType::Get => 4,
            MessageType::List => 5,
            MessageType::AddRow => 6,
            MessageType::DeleteRow => 7,
            MessageType::Ack => 8,
            MessageType::Nack => 9,
            MessageType::Ping => 10,
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Register),
            1 => Ok(MessageType::Unregister),
            2 => Ok(MessageType::UpdateObjects),
            3 => Ok(MessageType::Set),
            4 => Ok(MessageType::Get),
            5 => Ok(MessageType::List),
            6 => Ok(MessageType::AddRow),
            7 => Ok(MessageType::DeleteRow),
            8 => Ok(MessageType::Ack),
            9 => Ok(MessageType::Nack),
            10 => Ok(MessageType::Ping),
            other => Err(format!("unknown message type ({other})")),
        }
    }
}

/// Declared value type of an [`Object`]
///
/// `DynamicList` sits far away from the scalar types so that scalar additions
/// never collide with it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ObjectType {
    #[default]
    String,
    Int,
    UnsignedInt,
    Bool,
    DateTime,
    Base64,
    Long,
    UnsignedLong,
    Float,
    Double,
    Byte,
    Row,
    DynamicList,
}

impl From<ObjectType> for u32 {
    fn from(value: ObjectType) -> u32 {
        match value {
            ObjectType::String => 0,
            ObjectType::Int => 1,
            ObjectType::UnsignedInt => 2,
            ObjectType::Bool => 3,
            ObjectType::DateTime => 4,
            ObjectType::Base64 => 5,
            ObjectType::Long => 6,
            ObjectType::UnsignedLong => 7,
            ObjectType::Float => 8,
            ObjectType::Double => 9,
            ObjectType::Byte => 10,
            ObjectType::Row => 11,
            ObjectType::DynamicList => 100_000_000,
        }
    }
}

impl TryFrom<u32> for ObjectType {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectType::String),
            1 => Ok(ObjectType::Int),
            2 => Ok(ObjectType::UnsignedInt),
            3 => Ok(ObjectType::Bool),
            4 => Ok(ObjectType::DateTime),
            5 => Ok(ObjectType::Base64),
            6 => Ok(ObjectType::Long),
            7 => Ok(ObjectType::UnsignedLong),
            8 => Ok(ObjectType::Float),
            9 => Ok(ObjectType::Double),
            10 => Ok(ObjectType::Byte),
            11 => Ok(ObjectType::Row),
            100_000_000 => Ok(ObjectType::DynamicList),
            other => Err(format!("unknown object type ({other})")),
        }
    }
}

/// Access mode of an [`Object`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ObjectAccess {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl From<ObjectAccess> for u32 {
    fn from(value: ObjectAccess) -> u32 {
        match value {
            ObjectAccess::ReadWrite => 0,
            ObjectAccess::ReadOnly => 1,
        }
    }
}

impl TryFrom<u32> for ObjectAccess {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectAccess::ReadWrite),
            1 => Ok(ObjectAccess::ReadOnly),
            other => Err(format!("unknown object access ({other})")),
        }
    }
}

/// A named leaf or list root in the data model
///
/// Names are dotted paths; a name ends with `.` iff the object is a dynamic
/// list root or a row prefix. `value` is only populated on replies and on
/// write requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub name: String,
    #[serde(default)]
    pub access: ObjectAccess,
    #[serde(rename = "type", default)]
    pub object_type: ObjectType,
    #[serde(rename = "indexablefrom", default, skip_serializing_if = "Option::is_none")]
    pub indexable_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Object {
    /// An object carrying only a name, as synthesized when routing a path
    /// under a dynamic list prefix.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            access: ObjectAccess::default(),
            object_type: ObjectType::default(),
            indexable_from: None,
            value: None,
        }
    }

    /// Whether this object claims a whole prefix namespace
    pub fn is_dynamic_list(&self) -> bool {
        self.object_type == ObjectType::DynamicList
    }
}

/// One frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(rename = "transactionUID", default = "Uuid::nil")]
    pub transaction_uid: Uuid,
    #[serde(rename = "sourceName", default, skip_serializing_if = "String::is_empty")]
    pub source_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(rename = "object", default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<Object>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            transaction_uid: Uuid::nil(),
            source_name: String::new(),
            source: String::new(),
            destination: String::new(),
            objects: Vec::new(),
            error: String::new(),
        }
    }
}

/// Mint a fresh transaction UID for a request-expecting-ack
pub fn transaction_uid() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(u32::from(MessageType::Register), 0);
        assert_eq!(u32::from(MessageType::Set), 3);
        assert_eq!(u32::from(MessageType::Get), 4);
        assert_eq!(u32::from(MessageType::Ack), 8);
        assert_eq!(u32::from(MessageType::Nack), 9);
        assert_eq!(u32::from(MessageType::Ping), 10);

        for raw in 0..=10u32 {
            let parsed = MessageType::try_from(raw).unwrap();
            assert_eq!(u32::from(parsed), raw);
        }
        assert!(MessageType::try_from(11).is_err());
    }

    #[test]
    fn test_object_type_sentinel() {
        assert_eq!(u32::from(ObjectType::DynamicList), 100_000_000);
        assert_eq!(ObjectType::try_from(100_000_000).unwrap(), ObjectType::DynamicList);
        // No type may ever be assigned inside the gap
        assert!(ObjectType::try_from(12).is_err());
        assert!(ObjectType::try_from(99_999_999).is_err());
    }

    #[test]
    fn test_object_serializes_wire_field_names() {
        let object = Object {
            name: "Device.Custom.Setting1".to_string(),
            access: ObjectAccess::ReadOnly,
            object_type: ObjectType::Int,
            indexable_from: None,
            value: Some(serde_json::json!(600)),
        };

        let json = serde_json::to_value(&object).unwrap();
        assert_eq!(json["name"], "Device.Custom.Setting1");
        assert_eq!(json["access"], 1);
        assert_eq!(json["type"], 1);
        assert_eq!(json["value"], 600);
        assert!(json.get("indexablefrom").is_none());
    }

    #[test]
    fn test_message_roundtrip() {
        let mut message = Message::new(MessageType::Get);
        message.transaction_uid = transaction_uid();
        message.source_name = "testSource".to_string();
        message.source = "tcp://127.0.0.1:4401".to_string();
        message.destination = "tcp://127.0.0.1:4400".to_string();
        message.objects = vec![Object::named("Device.Custom.Version")];

        let bytes = serde_json::to_vec(&message).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Get);
        assert_eq!(decoded.transaction_uid, message.transaction_uid);
        assert_eq!(decoded.source_name, "testSource");
        assert_eq!(decoded.source, "tcp://127.0.0.1:4401");
        assert_eq!(decoded.destination, "tcp://127.0.0.1:4400");
        assert_eq!(decoded.objects, message.objects);
        assert!(decoded.error.is_empty());
    }

    #[test]
    fn test_message_tolerates_unknown_fields() {
        let json = r#"{
            "type": 8,
            "transactionUID": "018f0c56-0000-7000-8000-000000000000",
            "sourceName": "testSource",
            "futureField": {"nested": true}
        }"#;

        let decoded: Message = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ack);
        assert_eq!(decoded.source_name, "testSource");
        assert!(decoded.objects.is_empty());
    }

    #[test]
    fn test_transaction_uids_are_unique() {
        let a = transaction_uid();
        let b = transaction_uid();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }
}
