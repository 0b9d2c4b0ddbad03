//! Source endpoint
//!
//! A source owns a subset of the data model and serves it to one
//! coordinator. It registers its objects, answers forwarded Get/Set and row
//! mutations through its [`SourceHandler`], replies to liveness pings, and
//! re-registers on its own if the coordinator goes quiet. It can also act as
//! a client, reading and writing paths owned by other sources through the
//! coordinator.

mod core;
mod handler;

pub use core::Source;
pub use handler::SourceHandler;
