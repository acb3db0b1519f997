//! madang - Multi-transport application server core
//!
//! A single process exposes the same business logic ("actions") over HTTP and
//! runs a background job system ("tasks") with recurring and delayed
//! scheduling, coordinated through a shared registry and a cluster-wide
//! queue store.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`connection`] - Client connections and the connection registry
//! - [`registry`] - Action, task, and middleware registration
//! - [`action`] - The per-request action pipeline (validation, middleware, execution)
//! - [`routes`] - URL pattern matching and the route table
//! - [`task`] - Background task definitions, queues, and workers
//! - [`store`] - The queue/lock store boundary (in-memory and Redis)
//! - [`server`] - The server facade tying the pieces together
//! - [`web`] - The HTTP transport adapter
//!
//! # Example
//!
//! ```no_run
//! use madang::config::Config;
//! use madang::registry::RegistryBuilder;
//! use madang::server::Server;
//! use madang::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let registry = RegistryBuilder::new().build()?;
//!     let mut server = Server::new(config, registry);
//!     server.attach_store(Arc::new(MemoryStore::new()));
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod exception;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod server;
pub mod store;
pub mod task;
pub mod web;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::action::{
        Action, ActionContext, ActionMiddleware, ApiVersion, InputSpec, ResponseBody,
    };
    pub use crate::config::Config;
    pub use crate::connection::{Connection, ConnectionRegistry};
    pub use crate::error::{Error, ErrorCategory, MadangErrorTrait, Result};
    pub use crate::registry::{ApiRegistry, RegistryBuilder};
    pub use crate::server::Server;
    pub use crate::task::{Task, TaskPayload, TaskScope};
}

// Direct re-exports for convenience
pub use action::processor::{ActionProcessor, ActionStatus, CompletedAction};
pub use server::Server;
