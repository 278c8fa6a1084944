use crate::core::{
    BroadcastMessage, ElementKind, ElementOrPropertyStatus, Priority, PropertyChangeMessage,
};
use crate::queue::{Result, WorkQueue};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Pushes property-change messages onto the graph property queue.
///
/// Used by whatever writes to the graph, including workers that want their
/// own writes to cascade to other workers. Flush the graph store before
/// publishing so the consumer can see the write.
#[derive(Clone)]
pub struct PropertyChangePublisher {
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
}

impl PropertyChangePublisher {
    pub fn new(queue: Arc<dyn WorkQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Validates and enqueues `message` at its own priority.
    pub async fn publish(&self, message: &PropertyChangeMessage) -> Result<Uuid> {
        let payload = message.to_bytes()?;
        let id = self
            .queue
            .push(&self.queue_name, payload, message.priority)
            .await?;
        debug!(
            "Published change for {} {} (property={:?}) as message {}",
            message.element_kind,
            message.element_id,
            message.property(),
            id
        );
        Ok(id)
    }

    /// Enqueues a change covering every property of the element.
    pub async fn publish_element(
        &self,
        kind: ElementKind,
        element_id: &str,
        priority: Priority,
    ) -> Result<Uuid> {
        self.publish(&PropertyChangeMessage::for_element(kind, element_id, priority))
            .await
    }

    /// Enqueues a change to a single property.
    pub async fn publish_property(
        &self,
        kind: ElementKind,
        element_id: &str,
        property_key: &str,
        property_name: &str,
        priority: Priority,
    ) -> Result<Uuid> {
        self.publish(&PropertyChangeMessage::for_property(
            kind,
            element_id,
            property_key,
            property_name,
            priority,
        ))
        .await
    }

    /// Enqueues the removal of a property. Workers see the element as it
    /// was at `before_action_timestamp`, with the removed property still on it.
    pub async fn publish_property_deletion(
        &self,
        kind: ElementKind,
        element_id: &str,
        property_key: &str,
        property_name: &str,
        before_action_timestamp: i64,
        priority: Priority,
    ) -> Result<Uuid> {
        let message = PropertyChangeMessage::for_property(
            kind,
            element_id,
            property_key,
            property_name,
            priority,
        )
        .with_status(ElementOrPropertyStatus::Deletion)
        .with_before_action_timestamp(before_action_timestamp);
        self.publish(&message).await
    }

    /// Tells broadcast subscribers (a UI, say) that the element changed.
    pub async fn notify(&self, message: &PropertyChangeMessage) -> Result<()> {
        let payload = BroadcastMessage::property_changed(message).to_bytes()?;
        self.queue.broadcast(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;

    #[tokio::test]
    async fn test_publish_round_trips_through_queue() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let publisher = PropertyChangePublisher::new(queue.clone(), "graphProperty");

        publisher
            .publish_property(ElementKind::Edge, "e1", "k", "label", Priority::High)
            .await
            .unwrap();

        let delivered = queue.next_message("graphProperty").await.unwrap().unwrap();
        assert_eq!(delivered.priority, Priority::High);
        let message = PropertyChangeMessage::from_bytes(&delivered.payload).unwrap();
        assert_eq!(message.element_kind, ElementKind::Edge);
        assert_eq!(message.property(), Some(("k", "label")));
    }

    #[tokio::test]
    async fn test_notify_broadcasts_property_change() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let publisher = PropertyChangePublisher::new(queue.clone(), "graphProperty");
        let mut rx = queue.subscribe_to_broadcast();

        let message = PropertyChangeMessage::for_element(ElementKind::Vertex, "v9", Priority::Low);
        publisher.notify(&message).await.unwrap();

        let received = BroadcastMessage::from_bytes(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(received.kind(), "propertyChange");
    }
}
