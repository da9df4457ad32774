//! Sample controller - reconciles Foo custom resources into Deployments
//!
//! Each Foo names a Deployment and a replica count. The controller creates
//! that Deployment, keeps its replica count in line with the Foo and reports
//! the Deployment's available replicas back on the Foo status.
//!
//! # Architecture
//!
//! - Informers keep local caches of Foos and Deployments
//! - Cache changes are reduced to Foo identities and put on a retry queue
//! - Workers take identities off the queue and reconcile them, reading only
//!   from the caches and writing only through the API server
//!
//! # Modules
//!
//! - [`crd`] - The Foo custom resource
//! - [`cache`] - Object identities and cache read capabilities
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`feed`] - Watch streams to cache updates to work items
//! - [`owner`] - Controller owner reference resolution
//! - [`controller`] - Reconciliation logic and the worker pool
//! - [`events`] - Kubernetes Event recording
//! - [`config`] - Command-line and client configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod feed;
pub mod owner;
pub mod queue;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
