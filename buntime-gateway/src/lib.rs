//! # Buntime Gateway
//!
//! Multi-tenant application runtime and reverse proxy. Requests map to
//! worker applications by URL path or `Host` header, pass through a
//! composable plugin pipeline (authentication, authorization, rate limiting,
//! metrics) and are served by pooled, LRU-evicted worker instances.
//!
//! The crate is a library plus a thin binary: `main` loads configuration,
//! [`server::create_server`] assembles the [`server::Runtime`], and the
//! dispatcher in [`dispatch`] drives every request through the pipeline.

pub mod config;
pub mod dispatch;
pub mod headers;
pub mod metrics;
pub mod middleware;
pub mod plugins;
pub mod pool;
pub mod runtime_error;
pub mod server;
pub mod testing;
pub mod vhost;
