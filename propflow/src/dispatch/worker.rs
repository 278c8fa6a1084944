//! Plugin contract for property workers.

use super::publisher::PropertyChangePublisher;
use crate::config::PipelineConfig;
use crate::core::{ElementOrPropertyStatus, Priority};
use crate::graph::{Authorizations, Element, GraphStore, Property, Visibility};
use crate::queue::WorkQueue;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Error returned by worker plugins.
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Everything a worker gets to set itself up, once, before it is wrapped.
#[derive(Clone)]
pub struct PrepareContext {
    pub graph: Arc<dyn GraphStore>,
    pub queue: Arc<dyn WorkQueue>,
    /// Publishes cascading property-change messages.
    pub publisher: PropertyChangePublisher,
    /// Authorizations the runner reads the graph with.
    pub authorizations: Authorizations,
    pub user_id: String,
    pub config: Arc<PipelineConfig>,
}

/// One `(element, property)` pair handed to a worker, plus the message
/// context it came from.
#[derive(Debug, Clone)]
pub struct WorkData {
    pub element: Arc<Element>,
    pub property: Property,
    pub workspace_id: Option<String>,
    pub visibility_source: Option<String>,
    /// Visibility translated from the source and workspace.
    pub visibility: Visibility,
    pub priority: Priority,
    pub status: Option<ElementOrPropertyStatus>,
    pub before_action_timestamp: Option<i64>,
    pub trace_enabled: bool,
    /// Property content copied to disk, for workers that need a file.
    pub local_file: Option<PathBuf>,
}

impl WorkData {
    pub fn local_file(&self) -> Option<&Path> {
        self.local_file.as_deref()
    }
}

/// A pluggable unit of work run when a matching property changes.
///
/// Workers are registered explicitly on
/// [`super::DispatchRunnerBuilder::register`]. `is_handled` runs on the
/// dispatcher's consumer task and must be cheap; `execute` runs on the
/// worker's own execution loop and may take as long as it needs.
///
/// Workers that write to the graph should use their own property key so
/// that concurrent workers do not overwrite each other.
#[async_trait]
pub trait PropertyWorker: Send + Sync {
    /// Name used in logs and in the status snapshot.
    fn name(&self) -> &str;

    /// Called once before the worker starts receiving jobs.
    async fn prepare(&mut self, context: &PrepareContext) -> Result<(), WorkerError> {
        let _ = context;
        Ok(())
    }

    /// Whether this worker wants to process `property` on `element`.
    fn is_handled(&self, element: &Element, property: &Property) -> bool;

    async fn execute(&self, data: &WorkData) -> Result<(), WorkerError>;

    /// When true the property value is copied into a temporary file before
    /// `execute` and the path is passed in [`WorkData::local_file`].
    fn is_local_file_required(&self) -> bool {
        false
    }
}
