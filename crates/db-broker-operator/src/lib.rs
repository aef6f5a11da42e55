//! Keeps a managed database in sync with the lifecycle of a Kubernetes workload.
//!
//! Two controllers cooperate:
//!
//! - the [broker controller](controller::broker) provisions a database instance and its
//!   credentials for every [`DbBroker`](crd::DbBroker) and marks it ready,
//! - the [workload controller](controller::workload) creates and deletes brokers based on
//!   the annotations of a `Deployment` and injects the connection details into its first
//!   container once the broker is ready.

pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod credentials;
pub mod env;
pub mod finalizer;
pub mod logging;
pub mod namespace;
pub mod provisioner;
pub mod secret_gen;
pub mod store;
pub mod utils;

// External re-exports
pub use k8s_openapi;
pub use kube;
