//! dmhub - data-model federation broker
//!
//! A central coordinator aggregates a hierarchical dotted-path parameter
//! tree whose leaves are contributed by sources running in separate
//! processes. Clients read, write and enumerate the union tree; the
//! coordinator routes each request to the owning source, correlates the
//! reply by transaction UID, and evicts sources whose liveness pings stop.
//!
//! # Core Concepts
//!
//! - **Push/pull transport**: every endpoint pairs a dialing [`Pusher`] with
//!   a listening [`Puller`]; either peer may restart at any time and the
//!   pusher redials forever.
//! - **Transaction correlation**: each request carries a fresh UID; the
//!   requester parks on a [`TransactionMap`] until the echoing Ack/Nack
//!   arrives or a deadline fires.
//! - **Ownership registry**: exact object names and dynamic list prefixes
//!   form disjoint maps with strict uniqueness; the longest registered
//!   prefix claims any path beneath it.
//! - **Liveness**: the coordinator pings every source each period and
//!   evicts after five silent periods; orphaned sources re-register on
//!   their own.
//!
//! # Modules
//!
//! - [`message`] - wire schema and transaction UID generation
//! - [`transaction`] - UID to reply correlation table
//! - [`transport`] - framed push/pull socket pair
//! - [`source`] - source endpoint and its handler trait
//! - [`coordinator`] - coordinator endpoint and its handler trait
//! - [`config`] - endpoint tuning knobs
//! - [`cli`] - command-line driver definitions

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod source;
pub mod transaction;
pub mod transport;

pub use config::{CoordinatorConfig, SourceConfig};
pub use coordinator::{Coordinator, CoordinatorHandler};
pub use error::{Error, Result};
pub use message::{Message, MessageType, Object, ObjectAccess, ObjectType, transaction_uid};
pub use source::{Source, SourceHandler};
pub use transaction::TransactionMap;
pub use transport::{Puller, Pusher};
