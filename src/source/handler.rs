//! Application callbacks invoked by the source dispatch loop

use async_trait::async_trait;
use eyre::Result;

use crate::message::Object;

/// Callbacks that produce and mutate the values a source serves
///
/// The dispatch loop invokes these off its own task; implementations may
/// block on I/O. Any returned error is relayed verbatim in the Nack sent
/// back to the coordinator. A source without a handler Nacks every
/// handler-requiring request with "source handler not set".
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Produce current values for the named objects
    async fn get_objects(&self, object_names: &[String]) -> Result<Vec<Object>>;

    /// Apply the values carried by the objects
    async fn set_objects(&self, objects: Vec<Object>) -> Result<()>;

    /// Append a row under the dynamic list named by `object`, returning the
    /// new row's name
    async fn add_row(&self, object: Object) -> Result<String>;

    /// Delete the row named by `row`
    async fn delete_row(&self, row: Object) -> Result<()>;
}
