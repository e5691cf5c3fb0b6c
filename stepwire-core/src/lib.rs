//! # Stepwire Core
//!
//! Messaging and coordination layer for long-running workflows.
//!
//! ## Overview
//!
//! - **Typed messaging**: a [`MessageCatalog`](messaging::MessageCatalog) of
//!   named message types, a [`Publisher`](messaging::Publisher) that refuses
//!   anything failing its schema, and a [`Subscriber`](messaging::Subscriber)
//!   that validates every delivery before it reaches a handler
//! - **RPC**: request/response over the same broker, correlated by id and
//!   bounded by a timeout
//! - **Step coordination**: durable delays and external source connections,
//!   persisted first and announced on the task queue second
//!
//! ## Feature Flags
//!
//! - `database`: PostgreSQL-backed [`WorkflowStore`](coordination::WorkflowStore)
//! - `redis`: Redis Streams broker
//! - `e2e`: tests that need a live PostgreSQL database

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod broker;
pub mod coordination;
pub mod error;
pub mod messaging;
#[cfg(feature = "database")]
pub mod persistence;
pub mod rpc;
pub mod task_queue;

#[cfg(feature = "database")]
pub use persistence::MIGRATOR;

pub use error::{
    CoordinatorError, HandlerError, MessagingError, RecordKind, Result, RpcError,
    SchemaTarget, StoreError,
};
