use super::{
    Authorizations, Element, GraphError, GraphResult, GraphStore, Property, Visibility,
};
use crate::core::ElementKind;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

enum PendingWrite {
    Add {
        kind: ElementKind,
        id: String,
        property: Property,
    },
    Remove {
        kind: ElementKind,
        id: String,
        key: String,
        name: String,
    },
}

/// A property taken off an element by a flush.
struct RemovedProperty {
    property: Property,
    removed_at: i64,
}

type ElementKey = (ElementKind, String);

/// In-memory property graph.
///
/// Property writes are buffered and only applied by [`GraphStore::flush`],
/// so code that forgets to flush behaves here as it would against a store
/// with deferred indexing. Elements seeded with
/// [`InMemoryGraph::insert_element`] are visible immediately.
///
/// Visibility evaluation understands conjunctions of alternatives, the
/// shape produced by [`super::DefaultVisibilityTranslator`]: `(a)&(b|c)`
/// is readable with `a` and either `b` or `c`.
///
/// Removed properties and deleted elements are kept with the time they
/// went away, so [`GraphStore::get_element_at`] can still see them.
#[derive(Default)]
pub struct InMemoryGraph {
    elements: DashMap<ElementKey, Element>,
    removed: DashMap<ElementKey, Vec<RemovedProperty>>,
    deleted: DashMap<ElementKey, (Element, i64)>,
    pending: Mutex<Vec<PendingWrite>>,
    flushes: AtomicU64,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an element, bypassing the write buffer.
    pub fn insert_element(&self, element: Element) {
        let key = (element.kind, element.id.clone());
        self.deleted.remove(&key);
        self.elements.insert(key, element);
    }

    /// Deletes an element immediately, bypassing the write buffer.
    pub fn delete_element(&self, kind: ElementKind, id: &str) -> Option<Element> {
        let key = (kind, id.to_string());
        let (key, element) = self.elements.remove(&key)?;
        self.deleted
            .insert(key, (element.clone(), Utc::now().timestamp_millis()));
        Some(element)
    }

    /// Number of completed flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Number of buffered writes waiting for a flush.
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn buffer(&self, write: PendingWrite) -> GraphResult<()> {
        self.pending
            .lock()
            .map_err(|_| GraphError::store("write buffer poisoned"))?
            .push(write);
        Ok(())
    }

    fn can_read(visibility: &Visibility, authorizations: &Authorizations) -> bool {
        visibility
            .expression()
            .split('&')
            .map(|term| term.trim().trim_start_matches('(').trim_end_matches(')'))
            .filter(|term| !term.is_empty())
            .all(|term| {
                term.split('|')
                    .any(|label| authorizations.contains(label.trim()))
            })
    }

    fn visible_copy(element: &Element, authorizations: &Authorizations) -> Option<Element> {
        if !Self::can_read(&element.visibility, authorizations) {
            return None;
        }
        let mut copy = element.clone();
        copy.properties
            .retain(|p| Self::can_read(&p.visibility, authorizations));
        Some(copy)
    }

    fn ensure_visible(
        &self,
        kind: ElementKind,
        id: &str,
        authorizations: &Authorizations,
    ) -> GraphResult<()> {
        let key = (kind, id.to_string());
        match self.elements.get(&key) {
            Some(element) if Self::can_read(&element.visibility, authorizations) => Ok(()),
            _ => Err(GraphError::element_not_found(kind, id)),
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn get_element(
        &self,
        kind: ElementKind,
        id: &str,
        authorizations: &Authorizations,
    ) -> GraphResult<Option<Element>> {
        Ok(self
            .elements
            .get(&(kind, id.to_string()))
            .and_then(|element| Self::visible_copy(&element, authorizations)))
    }

    async fn get_element_at(
        &self,
        kind: ElementKind,
        id: &str,
        timestamp: i64,
        authorizations: &Authorizations,
    ) -> GraphResult<Option<Element>> {
        let key = (kind, id.to_string());
        let mut element = match self.elements.get(&key) {
            Some(element) => element.clone(),
            None => match self.deleted.get(&key) {
                Some(entry) if entry.1 > timestamp => entry.0.clone(),
                _ => return Ok(None),
            },
        };

        // oldest removal first, so the value held at `timestamp` wins
        if let Some(removed) = self.removed.get(&key) {
            for entry in removed.iter().filter(|r| r.removed_at > timestamp) {
                let property = &entry.property;
                if element.property(&property.key, &property.name).is_none() {
                    element.properties.push(property.clone());
                }
            }
        }
        Ok(Self::visible_copy(&element, authorizations))
    }

    async fn add_property(
        &self,
        kind: ElementKind,
        id: &str,
        property: Property,
        authorizations: &Authorizations,
    ) -> GraphResult<()> {
        self.ensure_visible(kind, id, authorizations)?;
        self.buffer(PendingWrite::Add {
            kind,
            id: id.to_string(),
            property,
        })
    }

    async fn remove_property(
        &self,
        kind: ElementKind,
        id: &str,
        key: &str,
        name: &str,
        authorizations: &Authorizations,
    ) -> GraphResult<()> {
        self.ensure_visible(kind, id, authorizations)?;
        self.buffer(PendingWrite::Remove {
            kind,
            id: id.to_string(),
            key: key.to_string(),
            name: name.to_string(),
        })
    }

    async fn related_vertices(
        &self,
        vertex_id: &str,
        label: Option<&str>,
        authorizations: &Authorizations,
    ) -> GraphResult<Vec<Element>> {
        let mut other_ids = Vec::new();
        for entry in self.elements.iter() {
            let edge = entry.value();
            let Some(ends) = &edge.edge else { continue };
            if label.is_some_and(|l| l != ends.label)
                || !Self::can_read(&edge.visibility, authorizations)
            {
                continue;
            }
            if ends.out_vertex_id == vertex_id {
                other_ids.push(ends.in_vertex_id.clone());
            } else if ends.in_vertex_id == vertex_id {
                other_ids.push(ends.out_vertex_id.clone());
            }
        }

        other_ids.sort();
        other_ids.dedup();
        Ok(other_ids
            .into_iter()
            .filter_map(|id| {
                self.elements
                    .get(&(ElementKind::Vertex, id))
                    .and_then(|v| Self::visible_copy(&v, authorizations))
            })
            .collect())
    }

    async fn flush(&self) -> GraphResult<()> {
        let writes = std::mem::take(
            &mut *self
                .pending
                .lock()
                .map_err(|_| GraphError::store("write buffer poisoned"))?,
        );

        let count = writes.len();
        let now = Utc::now().timestamp_millis();
        for write in writes {
            match write {
                PendingWrite::Add { kind, id, property } => {
                    if let Some(mut element) = self.elements.get_mut(&(kind, id)) {
                        element.set_property(property);
                    }
                }
                PendingWrite::Remove {
                    kind,
                    id,
                    key,
                    name,
                } => {
                    let element_key = (kind, id);
                    let Some(mut element) = self.elements.get_mut(&element_key) else {
                        continue;
                    };
                    let Some(index) = element
                        .properties
                        .iter()
                        .position(|p| p.key == key && p.name == name)
                    else {
                        continue;
                    };
                    let property = element.properties.remove(index);
                    drop(element);
                    self.removed
                        .entry(element_key)
                        .or_default()
                        .push(RemovedProperty {
                            property,
                            removed_at: now,
                        });
                }
            }
        }

        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("Flushed {} graph writes", count);
        Ok(())
    }
}
