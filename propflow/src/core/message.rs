//! Wire-level description of a property change.
//!
//! A [`PropertyChangeMessage`] is what gets pushed onto the graph property
//! queue after a write to the property graph. It either names one property
//! of an element (both `propertyKey` and `propertyName` set) or the element
//! as a whole (both absent).

use super::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Scheduling hint attached to every queued message.
///
/// Ordered `Low < Normal < High`. Backends use it to prefer higher bands
/// but it is never a hard ordering guarantee.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// All priorities, highest first.
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Returns the string representation of the priority.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
        }
    }

    /// Numeric rank used by transports (LOW=0, NORMAL=1, HIGH=2).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    /// Inverse of [`Priority::rank`]. Out-of-range ranks clamp to `High`.
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "NORMAL" => Ok(Priority::Normal),
            "HIGH" => Ok(Priority::High),
            _ => Err(CoreError::InvalidPriority(s.to_string())),
        }
    }
}

/// Whether a message refers to a vertex or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Vertex,
    Edge,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementKind::Vertex => write!(f, "vertex"),
            ElementKind::Edge => write!(f, "edge"),
        }
    }
}

/// What happened to the element or property that triggered the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementOrPropertyStatus {
    Update,
    Deletion,
    Hidden,
    Unhidden,
}

/// A change to one property of an element, or to the element as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChangeMessage {
    pub element_kind: ElementKind,
    pub element_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_source: Option<String>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ElementOrPropertyStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_action_timestamp: Option<i64>,
    #[serde(default)]
    pub trace_enabled: bool,
}

impl PropertyChangeMessage {
    /// A message covering every current property of an element.
    pub fn for_element(kind: ElementKind, element_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            element_kind: kind,
            element_id: element_id.into(),
            property_key: None,
            property_name: None,
            workspace_id: None,
            visibility_source: None,
            priority,
            status: None,
            before_action_timestamp: None,
            trace_enabled: false,
        }
    }

    /// A message naming exactly one property of an element.
    pub fn for_property(
        kind: ElementKind,
        element_id: impl Into<String>,
        property_key: impl Into<String>,
        property_name: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            property_key: Some(property_key.into()),
            property_name: Some(property_name.into()),
            ..Self::for_element(kind, element_id, priority)
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_visibility_source(mut self, source: impl Into<String>) -> Self {
        self.visibility_source = Some(source.into());
        self
    }

    pub fn with_status(mut self, status: ElementOrPropertyStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Epoch millis just before the change was made. Deletion and hidden
    /// messages are resolved against the element as it was at this time.
    pub fn with_before_action_timestamp(mut self, timestamp: i64) -> Self {
        self.before_action_timestamp = Some(timestamp);
        self
    }

    /// Whether this message reports something going away, so the element
    /// must be read as it was before the change.
    pub fn reads_before_action(&self) -> bool {
        matches!(
            self.status,
            Some(ElementOrPropertyStatus::Deletion | ElementOrPropertyStatus::Hidden)
        )
    }

    /// Returns the `(key, name)` pair when the message names a single property.
    pub fn property(&self) -> Option<(&str, &str)> {
        match (&self.property_key, &self.property_name) {
            (Some(key), Some(name)) => Some((key.as_str(), name.as_str())),
            _ => None,
        }
    }

    /// Checks the structural invariants of the message.
    ///
    /// # Errors
    /// Returns `CoreError::InvalidMessage` if the element id is empty or if
    /// only one of `propertyKey` / `propertyName` is present.
    pub fn validate(&self) -> Result<()> {
        if self.element_id.is_empty() {
            return Err(CoreError::InvalidMessage("elementId is empty".to_string()));
        }
        if self.property_key.is_some() != self.property_name.is_some() {
            return Err(CoreError::InvalidMessage(format!(
                "propertyKey and propertyName must be set together (key={:?}, name={:?})",
                self.property_key, self.property_name
            )));
        }
        Ok(())
    }

    /// Decodes and validates a message from its JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let message: Self = super::deserialize_value(bytes)?;
        message.validate()?;
        Ok(message)
    }

    /// Encodes the message into its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        super::serialize_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::from_rank(Priority::High.rank() as i64), Priority::High);
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert!("URGENT".parse::<Priority>().is_err());
    }

    #[test]
    fn test_wire_format_is_flat_camel_case() {
        let message = PropertyChangeMessage::for_property(
            ElementKind::Vertex,
            "v1",
            "tika",
            "http://example.org#text",
            Priority::High,
        )
        .with_workspace("ws1");

        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(json["elementKind"], "vertex");
        assert_eq!(json["elementId"], "v1");
        assert_eq!(json["propertyKey"], "tika");
        assert_eq!(json["workspaceId"], "ws1");
        assert_eq!(json["priority"], "HIGH");
        assert!(json.get("visibilitySource").is_none());
    }

    #[test]
    fn test_half_named_property_is_rejected() {
        let raw = br#"{"elementKind":"edge","elementId":"e1","propertyKey":"k","priority":"LOW"}"#;
        let result = PropertyChangeMessage::from_bytes(raw);
        assert!(matches!(result, Err(CoreError::InvalidMessage(_))));
    }

    #[test]
    fn test_missing_priority_is_rejected() {
        let raw = br#"{"elementKind":"vertex","elementId":"v1"}"#;
        assert!(PropertyChangeMessage::from_bytes(raw).is_err());
    }

    #[test]
    fn test_element_message_has_no_property() {
        let message = PropertyChangeMessage::for_element(ElementKind::Vertex, "v1", Priority::Low);
        assert!(message.property().is_none());
        assert!(message.validate().is_ok());
    }

    #[test]
    fn test_deletions_read_before_the_action() {
        let message = PropertyChangeMessage::for_property(
            ElementKind::Vertex,
            "v1",
            "k",
            "title",
            Priority::High,
        );
        assert!(!message.reads_before_action());

        let deletion = message
            .clone()
            .with_status(ElementOrPropertyStatus::Deletion)
            .with_before_action_timestamp(41);
        assert!(deletion.reads_before_action());
        let json: serde_json::Value = serde_json::from_slice(&deletion.to_bytes().unwrap()).unwrap();
        assert_eq!(json["status"], "DELETION");
        assert_eq!(json["beforeActionTimestamp"], 41);

        let hidden = message.clone().with_status(ElementOrPropertyStatus::Hidden);
        assert!(hidden.reads_before_action());
        assert!(!message
            .with_status(ElementOrPropertyStatus::Unhidden)
            .reads_before_action());
    }
}
