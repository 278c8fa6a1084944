//! Envelope for notifications sent on the broadcast channel.

use super::error::Result;
use super::message::{ElementKind, PropertyChangeMessage};
use super::process::LongRunningProcessRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Users allowed to see a broadcast. An empty list means everyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BroadcastPermissions {
    #[serde(default)]
    pub users: Vec<String>,
}

/// A notification published on the best-effort broadcast channel.
///
/// Serialized as `{"type": ..., "permissions": {...}, "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastMessage {
    LongRunningProcessChange {
        permissions: BroadcastPermissions,
        data: LongRunningProcessRecord,
    },
    LongRunningProcessDeleted {
        permissions: BroadcastPermissions,
        data: ProcessDeleted,
    },
    PropertyChange {
        permissions: BroadcastPermissions,
        data: PropertyChanged,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDeleted {
    pub process_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChanged {
    pub element_kind: ElementKind,
    pub element_id: String,
    #[serde(default)]
    pub property_key: Option<String>,
    #[serde(default)]
    pub property_name: Option<String>,
}

impl BroadcastMessage {
    pub fn process_changed(record: &LongRunningProcessRecord) -> Self {
        BroadcastMessage::LongRunningProcessChange {
            permissions: BroadcastPermissions {
                users: vec![record.user_id.clone()],
            },
            data: record.clone(),
        }
    }

    pub fn process_deleted(process_id: Uuid, user_id: &str) -> Self {
        BroadcastMessage::LongRunningProcessDeleted {
            permissions: BroadcastPermissions {
                users: vec![user_id.to_string()],
            },
            data: ProcessDeleted { process_id },
        }
    }

    pub fn property_changed(message: &PropertyChangeMessage) -> Self {
        BroadcastMessage::PropertyChange {
            permissions: BroadcastPermissions::default(),
            data: PropertyChanged {
                element_kind: message.element_kind,
                element_id: message.element_id.clone(),
                property_key: message.property_key.clone(),
                property_name: message.property_name.clone(),
            },
        }
    }

    /// Name of the notification as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::LongRunningProcessChange { .. } => "longRunningProcessChange",
            BroadcastMessage::LongRunningProcessDeleted { .. } => "longRunningProcessDeleted",
            BroadcastMessage::PropertyChange { .. } => "propertyChange",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        super::serialize_value(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        super::deserialize_value(bytes)
    }
}
