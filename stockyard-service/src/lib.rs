//! # stockyard
//!
//! Vendor-neutral data ingestion broker: a long-lived process that accepts
//! parameterized data requests over HTTP, routes them to pluggable upstream
//! vendors (plain HTTP APIs and one stateful binary-framed TCP gateway),
//! applies per-endpoint rate limiting and time-range chunking, correlates
//! asynchronous responses back to their requests, and persists results into
//! PostgreSQL. A scheduling daemon replays templated request sets on a
//! cadence, and a coverage planner diffs desired date ranges against what
//! the store already holds, issuing only the missing requests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stockyard_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config);
//!
//!     let registry = Arc::new(VendorRegistry::build(&config)?);
//!     let pipeline = Pipeline::new(Arc::clone(&registry), None);
//!     tokio::spawn(Arc::clone(&pipeline).run());
//!
//!     let state = AppState::new(Arc::new(config.clone()), pipeline);
//!     stockyard_service::http::serve(&config, state).await
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ids;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod planner;
pub mod scheduler;
pub mod state;
pub mod timefmt;
pub mod vendor;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Config, DaemonConfig, DatabaseConfig, VendorConfig};
    pub use crate::db::{Coverage, Gateway, TableCoverage};
    pub use crate::error::{Error, Result};
    pub use crate::ids::{CorrId, CorrIdSource};
    pub use crate::model::{
        Context, Field, FieldKind, Record, Request, RequestParams, RequestWire, Resource,
        ResourceClass, Response, Scalar,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{Pipeline, Priority, RequestQueue, ResponseStore};
    pub use crate::planner::{Planner, TemplateItem};
    pub use crate::scheduler::{Daemon, Schedule};
    pub use crate::state::AppState;
    pub use crate::vendor::{Endpoint, EndpointSpec, HttpSessionSpec, Vendor, VendorRegistry};
}
