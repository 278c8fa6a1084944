//! Propflow: property-graph mutation pipeline
//!
//! `propflow` drives pluggable processing over changes to a shared property
//! graph, and tracks long-lived background jobs with live progress.
//!
//! # Features
//!
//! - **Priority queues**: named queues with HIGH, NORMAL and LOW bands, at-least-once delivery and dead-lettering
//! - **Dispatch**: every changed property is offered to every registered worker
//! - **Failure isolation**: each worker runs on its own loop; its errors and panics stay there
//! - **Long-running processes**: persisted records with progress, cancel and broadcast notifications
//!
//! # Quick Start
//!
//! ```ignore
//! use propflow::prelude::*;
//!
//! struct TitleIndexer;
//!
//! #[async_trait::async_trait]
//! impl PropertyWorker for TitleIndexer {
//!     fn name(&self) -> &str {
//!         "title-indexer"
//!     }
//!
//!     fn is_handled(&self, _element: &Element, property: &Property) -> bool {
//!         property.name == "title"
//!     }
//!
//!     async fn execute(&self, data: &WorkData) -> Result<(), WorkerError> {
//!         println!("indexing {:?}", data.property.value.as_text());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = Arc::new(SqliteWorkQueue::new("propflow.db").await?);
//!     let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraph::new());
//!
//!     let handle = DispatchRunnerBuilder::new(graph, queue.clone())
//!         .register(TitleIndexer)
//!         .build()
//!         .await?
//!         .start();
//!
//!     PropertyChangePublisher::new(queue, "graphProperty")
//!         .publish_property(ElementKind::Vertex, "doc1", "k", "title", Priority::High)
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: message, record and broadcast models (hides the wire format)
//! - [`queue`]: queue backends (hides the transport)
//! - [`graph`]: property graph contracts (hides the graph database)
//! - [`dispatch`]: dispatch runner and worker execution
//! - [`process`]: long-running-process tracking
//! - [`config`]: pipeline configuration

pub mod config;
pub mod core;
pub mod dispatch;
pub mod graph;
pub mod process;
pub mod queue;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod status;

pub use config::{ConfigError, PipelineConfig, PriorityPolicyKind};

pub use core::{
    deserialize_value, serialize_value, BroadcastMessage, CoreError, ElementKind,
    ElementOrPropertyStatus, LongRunningProcessRecord, Priority, ProcessStatus,
    PropertyChangeMessage, Result as CoreResult,
};

pub use dispatch::{
    DispatchError, DispatchRunner, DispatchRunnerBuilder, JobOutcome, PrepareContext,
    PropertyChangePublisher, PropertyWorker, Result as DispatchResult, RunnerHandle, WorkData,
    WorkerError, WorkerStatus, WorkerWrapper,
};

pub use graph::{
    Authorizations, DefaultVisibilityTranslator, Element, GraphError, GraphResult, GraphStore,
    InMemoryGraph, Property, PropertyValue, StreamingValue, Visibility, VisibilityTranslator,
};

pub use process::{
    InMemoryProcessStore, LongRunningProcessTracker, LongRunningProcessWorker, ProcessContext,
    ProcessError, ProcessRunner, ProcessRunnerHandle, ProcessRunnerStatus, ProcessStore,
    ProcessTransition, Result as ProcessResult,
};

pub use queue::{
    InMemoryWorkQueue, PriorityPolicy, QueueError, QueueMessage, QueueStatusSnapshot,
    Result as QueueResult, WorkQueue,
};

pub use status::PipelineStatus;

#[cfg(feature = "sqlite")]
pub use process::SqliteProcessStore;

#[cfg(feature = "sqlite")]
pub use queue::SqliteWorkQueue;

// Re-export dependencies used in public API
pub use async_trait; // Users implement the worker traits with #[async_trait]
pub use serde;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```ignore
/// use propflow::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::PipelineConfig;

    pub use crate::core::{
        BroadcastMessage, ElementKind, ElementOrPropertyStatus, LongRunningProcessRecord,
        Priority, ProcessStatus, PropertyChangeMessage,
    };

    pub use crate::dispatch::{
        DispatchError, DispatchRunner, DispatchRunnerBuilder, PrepareContext,
        PropertyChangePublisher, PropertyWorker, RunnerHandle, WorkData, WorkerError,
    };

    pub use crate::graph::{
        Authorizations, Element, GraphStore, InMemoryGraph, Property, PropertyValue, Visibility,
        VisibilityTranslator,
    };

    pub use crate::process::{
        InMemoryProcessStore, LongRunningProcessTracker, LongRunningProcessWorker,
        ProcessContext, ProcessError, ProcessRunner, ProcessStore, ProcessWorkerError,
    };

    pub use crate::queue::{InMemoryWorkQueue, PriorityPolicy, WorkQueue};

    #[cfg(feature = "sqlite")]
    pub use crate::process::SqliteProcessStore;

    #[cfg(feature = "sqlite")]
    pub use crate::queue::SqliteWorkQueue;

    // Re-export commonly needed external types
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
