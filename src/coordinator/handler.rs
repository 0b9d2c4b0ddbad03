//! Embedder callbacks invoked on registry changes

use std::collections::HashMap;

use async_trait::async_trait;
use eyre::Result;

use crate::message::Object;

/// Notifications fired by the coordinator when its registry changes
///
/// Callbacks run on the coordinator's dispatch path while the registry is
/// held; keep them short. Errors are logged and never undo the registry
/// change that triggered them.
#[async_trait]
pub trait CoordinatorHandler: Send + Sync {
    /// A source came online and registered `objects`
    async fn registered(&self, source_name: &str, objects: &[Object]) -> Result<()>;

    /// A source went offline, explicitly or by eviction
    async fn unregistered(&self, source_name: &str, objects: &[Object]) -> Result<()>;

    /// A source replaced its object set; `deleted` holds the objects the
    /// update dropped
    async fn update_objects(
        &self,
        source_name: &str,
        objects: &[Object],
        deleted: &HashMap<String, Object>,
    ) -> Result<()>;
}
