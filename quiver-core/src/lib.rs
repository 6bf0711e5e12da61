//! # Quiver Core
//!
//! Core library for the Quiver function runtime. Hosts user-authored handler
//! files and fires them from six trigger sources:
//!
//! - **HTTP**: per-function invocation paths served by `quiver-server`
//! - **Schedule**: a 5-field cron subset evaluated every five seconds
//! - **Database**: Postgres LISTEN/NOTIFY with generic row triggers installed
//!   on demand
//! - **Event**: an in-process publish/subscribe bus
//! - **Once**: run-once bootstrap executions after every registry rescan
//! - **Webhook**: deliveries relayed by the Backend control plane
//!
//! Every invocation runs under the execution harness, which enforces the
//! configured timeout, captures handler log output, tracks per-function
//! status, and reports an execution record to the Backend.

/// Control-plane HTTP client
pub mod backend;

/// Postgres LISTEN/NOTIFY bridge
pub mod bridge;

/// Environment-driven configuration
pub mod config;

/// Error types and handling
pub mod error;

/// In-process event bus
pub mod events;

/// Function records, triggers, and status
pub mod function;

/// Handler abstraction and the process-backed host
pub mod handler;

/// Execution harness
pub mod harness;

/// Handler file loader
pub mod loader;

/// Function registry and the completed-run-once set
pub mod registry;

/// Cron scheduler
pub mod scheduler;

/// Runtime aggregate
pub mod runtime;

/// Functions directory watcher
pub mod watcher;

pub use backend::{BackendClient, ExecutionReport};
pub use config::{Config, PostgresConfig};
pub use error::{QuiverError, Result};
pub use events::{EventBinding, EventBus};
pub use function::{FunctionInfo, FunctionRecord, FunctionStatus, Trigger};
pub use handler::{
    ExecutionIds, FunctionContext, FunctionRequest, Handler, HandlerOutput, Headers, LogBuffer,
};
pub use harness::{ExecutionOutcome, Harness};
pub use registry::Registry;
pub use runtime::Runtime;
