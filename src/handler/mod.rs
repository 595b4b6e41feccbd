//! Handler module - per-request state.
//!
//! Provides:
//! - [`RequestRegistry`] - the table of in-flight requests
//! - [`RequestContext`] - lets a handler respond, stream, or fail
//!
//! # Example
//!
//! ```ignore
//! use ble_http_bridge::handler::{RequestContext, RequestRegistry};
//!
//! let registry = RequestRegistry::new();
//! let cancel = connection.child_token();
//! let generation = registry.insert(id, cancel.clone());
//!
//! let ctx = RequestContext::with_writer(id, cancel, writer.clone());
//! let task = tokio::spawn(async move {
//!     let _ = ctx.respond("ok".into()).await;
//! });
//! registry.attach(id, generation, task);
//! ```

mod context;
mod registry;

pub use context::RequestContext;
pub use registry::RequestRegistry;
