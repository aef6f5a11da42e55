use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{apps::v1::Deployment, core::v1::Secret},
};
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    client::Client as KubeClient,
    runtime::reflector::ObjectRef,
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    crd::{DbBroker, DbBrokerStatus, WORKLOAD_LABEL_KEY},
    finalizer,
    store::ObjectStore,
};

/// Field manager recorded on every write.
pub const FIELD_MANAGER: &str = "db-broker-operator";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object is missing key {key:?}"))]
    MissingObjectKey { key: &'static str },

    #[snafu(display("failed to get object {name:?}"))]
    GetObject { source: kube::Error, name: String },

    #[snafu(display("failed to list objects matching {selector:?}"))]
    ListObjects {
        source: kube::Error,
        selector: String,
    },

    #[snafu(display("failed to create object {name:?}"))]
    CreateObject { source: kube::Error, name: String },

    #[snafu(display("failed to replace object {name:?}"))]
    ReplaceObject { source: kube::Error, name: String },

    #[snafu(display("failed to patch object {name:?}"))]
    PatchObject { source: kube::Error, name: String },

    #[snafu(display("failed to patch status of object {name:?}"))]
    PatchObjectStatus { source: kube::Error, name: String },

    #[snafu(display("failed to delete object {name:?}"))]
    DeleteObject { source: kube::Error, name: String },
}

/// Namespaced Kubernetes objects the [`Client`] can read and write.
pub trait NamespacedObject:
    Clone + Debug + DeserializeOwned + Resource<DynamicType = (), Scope = NamespaceResourceScope>
{
}

impl<T> NamespacedObject for T where
    T: Clone + Debug + DeserializeOwned + Resource<DynamicType = (), Scope = NamespaceResourceScope>
{
}

/// This `Client` can be used to access Kubernetes.
/// It wraps an underlying [kube::client::Client] and provides some common functionality.
#[derive(Clone)]
pub struct Client {
    client: KubeClient,
    patch_params: PatchParams,
    post_params: PostParams,
    delete_params: DeleteParams,
}

impl Client {
    pub fn new(client: KubeClient, field_manager: Option<String>) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: field_manager.clone(),
                ..PostParams::default()
            },
            patch_params: PatchParams {
                field_manager,
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    /// Returns a [kube::client::Client]] that can be freely used.
    /// It does not need to be cloned before first use.
    pub fn as_kube_client(&self) -> KubeClient {
        self.client.clone()
    }

    pub fn get_all_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::all(self.client.clone())
    }

    pub fn get_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn api_for<T>(&self, resource: &T) -> Result<Api<T>>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        let namespace = resource
            .meta()
            .namespace
            .as_deref()
            .context(MissingObjectKeySnafu {
                key: "metadata.namespace",
            })?;
        Ok(self.get_api(namespace))
    }

    fn name_of<T: Resource>(resource: &T) -> Result<String> {
        resource.meta().name.clone().context(MissingObjectKeySnafu {
            key: "metadata.name",
        })
    }

    /// Retrieves a single object, `None` if it does not exist.
    pub async fn get_opt<T>(&self, name: &str, namespace: &str) -> Result<Option<T>>
    where
        T: NamespacedObject,
    {
        self.get_api::<T>(namespace)
            .get_opt(name)
            .await
            .context(GetObjectSnafu { name })
    }

    /// Retrieves all objects in `namespace` matching the label selector.
    pub async fn list_with_label_selector<T>(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<T>>
    where
        T: NamespacedObject,
    {
        Ok(self
            .get_api::<T>(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .context(ListObjectsSnafu { selector })?
            .items)
    }

    /// Creates a new resource.
    pub async fn create<T>(&self, resource: &T) -> Result<T>
    where
        T: NamespacedObject + Serialize,
    {
        self.api_for(resource)?
            .create(&self.post_params, resource)
            .await
            .context(CreateObjectSnafu {
                name: resource.name_any(),
            })
    }

    /// Replaces a resource.
    ///
    /// The `resourceVersion` of `resource` is sent along, so the write is rejected if the
    /// object changed since it was read.
    pub async fn replace<T>(&self, resource: &T) -> Result<T>
    where
        T: NamespacedObject + Serialize,
    {
        let name = Self::name_of(resource)?;
        self.api_for(resource)?
            .replace(&name, &self.post_params, resource)
            .await
            .context(ReplaceObjectSnafu { name })
    }

    /// Patches a resource using the `MERGE` patch strategy.
    /// This will fail for objects that do not exist yet.
    pub async fn merge_patch<T>(&self, resource: &T, patch: serde_json::Value) -> Result<T>
    where
        T: NamespacedObject,
    {
        let name = Self::name_of(resource)?;
        self.api_for(resource)?
            .patch(&name, &self.patch_params, &Patch::Merge(patch))
            .await
            .context(PatchObjectSnafu { name })
    }

    /// Merge-patches the status subresource.
    pub async fn merge_patch_status<T, S>(&self, resource: &T, status: &S) -> Result<T>
    where
        T: NamespacedObject,
        S: Serialize + Debug,
    {
        let name = Self::name_of(resource)?;
        let patch = serde_json::json!({ "status": status });
        self.api_for(resource)?
            .patch_status(&name, &self.patch_params, &Patch::Merge(patch))
            .await
            .context(PatchObjectStatusSnafu { name })
    }

    /// Deletes a resource. Depending on its finalizers the object may linger until they
    /// are removed.
    pub async fn delete<T>(&self, resource: &T) -> Result<()>
    where
        T: NamespacedObject,
    {
        let name = Self::name_of(resource)?;
        self.api_for(resource)?
            .delete(&name, &self.delete_params)
            .await
            .context(DeleteObjectSnafu { name })?;
        Ok(())
    }
}

fn namespace_of<K>(key: &ObjectRef<K>) -> Result<&str>
where
    K: Resource<DynamicType = ()>,
{
    key.namespace.as_deref().context(MissingObjectKeySnafu {
        key: "metadata.namespace",
    })
}

#[async_trait]
impl ObjectStore for Client {
    async fn get_broker(&self, key: &ObjectRef<DbBroker>) -> Result<Option<DbBroker>> {
        self.get_opt(&key.name, namespace_of(key)?).await
    }

    async fn list_brokers(&self, namespace: &str, workload_name: &str) -> Result<Vec<DbBroker>> {
        let selector = format!("{WORKLOAD_LABEL_KEY}={workload_name}");
        self.list_with_label_selector(namespace, &selector).await
    }

    async fn create_broker(&self, broker: &DbBroker) -> Result<DbBroker> {
        self.create(broker).await
    }

    async fn delete_broker(&self, broker: &DbBroker) -> Result<()> {
        self.delete(broker).await
    }

    async fn patch_broker_status(
        &self,
        broker: &DbBroker,
        status: &DbBrokerStatus,
    ) -> Result<DbBroker> {
        self.merge_patch_status(broker, status).await
    }

    async fn patch_broker_finalizers(
        &self,
        broker: &DbBroker,
        finalizers: Vec<String>,
    ) -> Result<DbBroker> {
        self.merge_patch(broker, finalizer::finalizers_patch(finalizers))
            .await
    }

    async fn get_workload(&self, key: &ObjectRef<Deployment>) -> Result<Option<Deployment>> {
        self.get_opt(&key.name, namespace_of(key)?).await
    }

    async fn replace_workload(&self, workload: &Deployment) -> Result<Deployment> {
        self.replace(workload).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(name, namespace).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.create(secret).await
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        self.replace(secret).await
    }
}
