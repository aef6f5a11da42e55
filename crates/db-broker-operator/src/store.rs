//! The reads and writes the controllers perform against the cluster.
//!
//! [`crate::client::Client`] implements [`ObjectStore`] on top of the Kubernetes API. Keeping
//! the surface this small lets the reconcilers be exercised without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
use kube::runtime::reflector::ObjectRef;

use crate::{
    client::Error,
    crd::{DbBroker, DbBrokerStatus},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Access to brokers, workloads and credential secrets.
///
/// Getters return `Ok(None)` when the object does not exist.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_broker(&self, key: &ObjectRef<DbBroker>) -> Result<Option<DbBroker>>;

    /// Lists the brokers labelled with `workload_name` in `namespace`.
    async fn list_brokers(&self, namespace: &str, workload_name: &str) -> Result<Vec<DbBroker>>;

    async fn create_broker(&self, broker: &DbBroker) -> Result<DbBroker>;

    async fn delete_broker(&self, broker: &DbBroker) -> Result<()>;

    async fn patch_broker_status(
        &self,
        broker: &DbBroker,
        status: &DbBrokerStatus,
    ) -> Result<DbBroker>;

    /// Replaces the finalizer list of the broker.
    async fn patch_broker_finalizers(
        &self,
        broker: &DbBroker,
        finalizers: Vec<String>,
    ) -> Result<DbBroker>;

    async fn get_workload(&self, key: &ObjectRef<Deployment>) -> Result<Option<Deployment>>;

    async fn replace_workload(&self, workload: &Deployment) -> Result<Deployment>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret>;
}
