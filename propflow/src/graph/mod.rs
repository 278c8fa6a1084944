//! Property graph collaborator contracts
//!
//! The pipeline reads elements and their properties through [`GraphStore`]
//! and scopes reads and writes with labels produced by a
//! [`VisibilityTranslator`]. Both are implemented outside this crate;
//! [`InMemoryGraph`] and [`DefaultVisibilityTranslator`] are reference
//! implementations for tests and embedding.
//!
//! # Shared state
//!
//! The store is the only mutable state shared between workers. The pipeline
//! takes no locks around it and relies on per-property writes being atomic.
//! Writes are not guaranteed visible to later reads (or to cascading
//! messages) until [`GraphStore::flush`] returns.

use crate::core::ElementKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

mod error;
mod memory;

pub use error::{GraphError, GraphResult};
pub use memory::InMemoryGraph;

/// Security labels a reader holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizations(Vec<String>);

impl Authorizations {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut auths = Self::default();
        for label in labels {
            auths.add(label);
        }
        auths
    }

    /// Adds a label if it is not already present.
    pub fn add(&mut self, label: impl Into<String>) {
        let label = label.into();
        if !self.0.contains(&label) {
            self.0.push(label);
        }
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.iter().any(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.0
    }
}

/// Boolean expression over security labels, e.g. `(secret)&(ws1|ws2)`.
///
/// An empty expression is visible to everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Visibility(String);

impl Visibility {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn public() -> Self {
        Self::default()
    }

    pub fn expression(&self) -> &str {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Large property content that may be streamed rather than held as a string.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingValue {
    data: Arc<[u8]>,
    mime_type: Option<String>,
}

impl StreamingValue {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Json(serde_json::Value),
    Stream(StreamingValue),
}

impl PropertyValue {
    /// Bytes a worker would read if the value were a file.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PropertyValue::Text(text) => text.as_bytes().to_vec(),
            PropertyValue::Json(value) => value.to_string().into_bytes(),
            PropertyValue::Stream(stream) => stream.bytes().to_vec(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A `(key, name) -> value` entry on an element.
///
/// The key separates writers: two workers can both write a property named
/// `title` without clobbering each other as long as they use their own keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub key: String,
    pub name: String,
    pub value: PropertyValue,
    pub visibility: Visibility,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Property {
    pub fn new(key: impl Into<String>, name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            value,
            visibility: Visibility::public(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }
}

/// Endpoints of an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEnds {
    pub label: String,
    pub out_vertex_id: String,
    pub in_vertex_id: String,
}

/// Snapshot of a vertex or edge as seen with some authorizations.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: ElementKind,
    pub id: String,
    pub visibility: Visibility,
    pub properties: Vec<Property>,
    /// Set for edges only.
    pub edge: Option<EdgeEnds>,
}

impl Element {
    pub fn vertex(id: impl Into<String>) -> Self {
        Self {
            kind: ElementKind::Vertex,
            id: id.into(),
            visibility: Visibility::public(),
            properties: Vec::new(),
            edge: None,
        }
    }

    pub fn edge(
        id: impl Into<String>,
        label: impl Into<String>,
        out_vertex_id: impl Into<String>,
        in_vertex_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: ElementKind::Edge,
            id: id.into(),
            visibility: Visibility::public(),
            properties: Vec::new(),
            edge: Some(EdgeEnds {
                label: label.into(),
                out_vertex_id: out_vertex_id.into(),
                in_vertex_id: in_vertex_id.into(),
            }),
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.set_property(property);
        self
    }

    /// Inserts or replaces the property with the same key and name.
    pub fn set_property(&mut self, property: Property) {
        match self
            .properties
            .iter_mut()
            .find(|p| p.key == property.key && p.name == property.name)
        {
            Some(existing) => *existing = property,
            None => self.properties.push(property),
        }
    }

    pub fn property(&self, key: &str, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.key == key && p.name == name)
    }

    /// Every property with `name`, across keys.
    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> {
        self.properties.iter().filter(move |p| p.name == name)
    }
}

/// Access to the property graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Looks up an element. `Ok(None)` means missing or not visible.
    async fn get_element(
        &self,
        kind: ElementKind,
        id: &str,
        authorizations: &Authorizations,
    ) -> GraphResult<Option<Element>>;

    /// Looks up an element as it was at `timestamp` (epoch millis),
    /// including properties removed and elements deleted after it.
    ///
    /// Stores without history fall back to the current state.
    async fn get_element_at(
        &self,
        kind: ElementKind,
        id: &str,
        timestamp: i64,
        authorizations: &Authorizations,
    ) -> GraphResult<Option<Element>> {
        let _ = timestamp;
        self.get_element(kind, id, authorizations).await
    }

    /// Adds or replaces the property with the same key and name.
    async fn add_property(
        &self,
        kind: ElementKind,
        id: &str,
        property: Property,
        authorizations: &Authorizations,
    ) -> GraphResult<()>;

    async fn remove_property(
        &self,
        kind: ElementKind,
        id: &str,
        key: &str,
        name: &str,
        authorizations: &Authorizations,
    ) -> GraphResult<()>;

    /// Vertices connected to `vertex_id` by an edge, optionally only edges
    /// with `label`.
    async fn related_vertices(
        &self,
        vertex_id: &str,
        label: Option<&str>,
        authorizations: &Authorizations,
    ) -> GraphResult<Vec<Element>>;

    /// Makes all previous writes visible to subsequent reads.
    async fn flush(&self) -> GraphResult<()>;
}

/// Turns a visibility source and workspace set into a [`Visibility`].
pub trait VisibilityTranslator: Send + Sync {
    fn to_visibility(&self, source: Option<&str>, workspace_ids: &[String]) -> Visibility;
}

/// Translator producing `(source)&(ws1|ws2|...)`.
///
/// Either part is left out when empty; no source and no workspaces yields
/// a public visibility.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVisibilityTranslator;

impl VisibilityTranslator for DefaultVisibilityTranslator {
    fn to_visibility(&self, source: Option<&str>, workspace_ids: &[String]) -> Visibility {
        let mut terms = Vec::new();
        if let Some(source) = source.map(str::trim).filter(|s| !s.is_empty()) {
            terms.push(format!("({})", source));
        }
        if !workspace_ids.is_empty() {
            terms.push(format!("({})", workspace_ids.join("|")));
        }
        Visibility::new(terms.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_translator() {
        let translator = DefaultVisibilityTranslator;
        assert!(translator.to_visibility(None, &[]).is_public());
        assert!(translator.to_visibility(Some("  "), &[]).is_public());
        assert_eq!(
            translator
                .to_visibility(Some("secret"), &["ws1".to_string(), "ws2".to_string()])
                .expression(),
            "(secret)&(ws1|ws2)"
        );
        assert_eq!(
            translator.to_visibility(None, &["ws1".to_string()]).expression(),
            "(ws1)"
        );
    }

    #[test]
    fn test_set_property_replaces_same_key_and_name() {
        let mut element = Element::vertex("v1")
            .with_property(Property::new("a", "title", PropertyValue::Text("one".into())))
            .with_property(Property::new("b", "title", PropertyValue::Text("two".into())));
        element.set_property(Property::new("a", "title", PropertyValue::Text("three".into())));

        assert_eq!(element.properties.len(), 2);
        assert_eq!(
            element.property("a", "title").unwrap().value.as_text(),
            Some("three")
        );
        assert_eq!(element.properties_named("title").count(), 2);
    }

    #[test]
    fn test_authorizations_deduplicate() {
        let auths = Authorizations::new(["a", "b", "a"]);
        assert_eq!(auths.labels(), &["a".to_string(), "b".to_string()]);
        assert!(auths.contains("b"));
    }
}
