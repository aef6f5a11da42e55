//! In-memory stand-ins for the cluster and the database API.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use db_broker_operator::{
    client,
    controller::{Reconciler, broker::BrokerReconciler, workload::WorkloadReconciler},
    crd::{DbBroker, DbBrokerStatus, WORKLOAD_LABEL_KEY},
    provisioner::{InstanceRequest, LinearBackoff, Provisioner, RemoteError, SqlAdmin},
    secret_gen::SecretGenerator,
    store::ObjectStore,
};
use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Secret},
    },
    apimachinery::pkg::apis::meta::v1::Time,
    jiff::Timestamp,
};
use kube::{
    ResourceExt,
    api::ObjectMeta,
    runtime::{controller::Action, reflector::ObjectRef},
};

pub const PROJECT: &str = "my-project";
pub const NAMESPACE: &str = "ns1";
pub const ADDRESS: &str = "10.0.0.7";

type Key = (String, String);

fn key_of<K: ResourceExt>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

#[derive(Default)]
struct Objects {
    brokers: BTreeMap<Key, DbBroker>,
    workloads: BTreeMap<Key, Deployment>,
    secrets: BTreeMap<Key, Secret>,
    next_uid: u32,
    writes: Vec<String>,
    /// Armed failures as `<verb> <kind>`, each consumed by the next matching write.
    failing: Vec<String>,
}

impl Objects {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }

    /// Logs a write, or fails it if a failure was armed for it.
    fn record_write<K: ResourceExt>(
        &mut self,
        verb: &str,
        kind: &str,
        object: &K,
    ) -> client::Result<()> {
        let name = object.name_any();
        let armed = format!("{verb} {kind}");
        if let Some(index) = self.failing.iter().position(|failing| *failing == armed) {
            self.failing.remove(index);
            let source = kube::Error::Service(format!("{armed}/{name} was refused").into());
            return Err(match verb {
                "create" => client::Error::CreateObject { source, name },
                "delete" => client::Error::DeleteObject { source, name },
                "replace" => client::Error::ReplaceObject { source, name },
                "patch-status" => client::Error::PatchObjectStatus { source, name },
                _ => client::Error::PatchObject { source, name },
            });
        }
        self.writes.push(format!("{armed}/{name}"));
        Ok(())
    }
}

/// An object store that behaves like the API server for the calls the controllers make:
/// objects with finalizers are only marked for deletion, and are removed once the last
/// finalizer is gone.
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Objects>,
}

impl FakeStore {
    fn lock(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put_workload(&self, mut workload: Deployment) {
        let mut objects = self.lock();
        if workload.metadata.uid.is_none() {
            workload.metadata.uid = Some(objects.uid());
        }
        objects.workloads.insert(key_of(&workload), workload);
    }

    pub fn put_broker(&self, mut broker: DbBroker) {
        let mut objects = self.lock();
        if broker.metadata.uid.is_none() {
            broker.metadata.uid = Some(objects.uid());
        }
        objects.brokers.insert(key_of(&broker), broker);
    }

    pub fn workload(&self, name: &str) -> Deployment {
        self.lock().workloads[&(NAMESPACE.to_owned(), name.to_owned())].clone()
    }

    pub fn brokers(&self) -> Vec<DbBroker> {
        self.lock().brokers.values().cloned().collect()
    }

    pub fn broker(&self, name: &str) -> Option<DbBroker> {
        self.lock()
            .brokers
            .get(&(NAMESPACE.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .get(&(NAMESPACE.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Drops a broker bypassing its finalizers.
    pub fn forget_broker(&self, name: &str) {
        self.lock()
            .brokers
            .remove(&(NAMESPACE.to_owned(), name.to_owned()));
    }

    /// Makes the next `<verb> <kind>` write fail, e.g. `"create secret"`.
    pub fn fail_next(&self, write: &str) {
        self.lock().failing.push(write.to_owned());
    }

    /// Every write so far, as `<verb> <kind>/<name>`.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Edits a workload the way a user would.
    pub fn edit_workload(&self, name: &str, edit: impl FnOnce(&mut Deployment)) {
        let mut objects = self.lock();
        if let Some(workload) = objects
            .workloads
            .get_mut(&(NAMESPACE.to_owned(), name.to_owned()))
        {
            edit(workload);
        }
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_broker(&self, key: &ObjectRef<DbBroker>) -> client::Result<Option<DbBroker>> {
        let key = (key.namespace.clone().unwrap_or_default(), key.name.clone());
        Ok(self.lock().brokers.get(&key).cloned())
    }

    async fn list_brokers(
        &self,
        namespace: &str,
        workload_name: &str,
    ) -> client::Result<Vec<DbBroker>> {
        Ok(self
            .lock()
            .brokers
            .values()
            .filter(|broker| {
                broker.namespace().as_deref() == Some(namespace)
                    && broker.labels().get(WORKLOAD_LABEL_KEY).map(String::as_str)
                        == Some(workload_name)
            })
            .cloned()
            .collect())
    }

    async fn create_broker(&self, broker: &DbBroker) -> client::Result<DbBroker> {
        let mut objects = self.lock();
        let mut broker = broker.clone();
        broker.metadata.uid = Some(objects.uid());
        objects.record_write("create", "dbbroker", &broker)?;
        objects.brokers.insert(key_of(&broker), broker.clone());
        Ok(broker)
    }

    async fn delete_broker(&self, broker: &DbBroker) -> client::Result<()> {
        let mut objects = self.lock();
        objects.record_write("delete", "dbbroker", broker)?;
        let key = key_of(broker);
        let Some(stored) = objects.brokers.get_mut(&key) else {
            return Ok(());
        };
        if stored.finalizers().is_empty() {
            objects.brokers.remove(&key);
        } else if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
        }
        Ok(())
    }

    async fn patch_broker_status(
        &self,
        broker: &DbBroker,
        status: &DbBrokerStatus,
    ) -> client::Result<DbBroker> {
        let mut objects = self.lock();
        objects.record_write("patch-status", "dbbroker", broker)?;
        let stored = objects
            .brokers
            .entry(key_of(broker))
            .or_insert_with(|| broker.clone());
        stored.status = Some(status.clone());
        Ok(stored.clone())
    }

    async fn patch_broker_finalizers(
        &self,
        broker: &DbBroker,
        finalizers: Vec<String>,
    ) -> client::Result<DbBroker> {
        let mut objects = self.lock();
        objects.record_write("patch-finalizers", "dbbroker", broker)?;
        let key = key_of(broker);
        let stored = objects
            .brokers
            .entry(key.clone())
            .or_insert_with(|| broker.clone());
        stored.metadata.finalizers = Some(finalizers);
        let patched = stored.clone();
        if patched.metadata.deletion_timestamp.is_some() && patched.finalizers().is_empty() {
            objects.brokers.remove(&key);
        }
        Ok(patched)
    }

    async fn get_workload(&self, key: &ObjectRef<Deployment>) -> client::Result<Option<Deployment>> {
        let key = (key.namespace.clone().unwrap_or_default(), key.name.clone());
        Ok(self.lock().workloads.get(&key).cloned())
    }

    async fn replace_workload(&self, workload: &Deployment) -> client::Result<Deployment> {
        let mut objects = self.lock();
        objects.record_write("replace", "deployment", workload)?;
        objects
            .workloads
            .insert(key_of(workload), workload.clone());
        Ok(workload.clone())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> client::Result<Option<Secret>> {
        let key = (namespace.to_owned(), name.to_owned());
        Ok(self.lock().secrets.get(&key).cloned())
    }

    async fn create_secret(&self, secret: &Secret) -> client::Result<Secret> {
        let mut objects = self.lock();
        objects.record_write("create", "secret", secret)?;
        objects.secrets.insert(key_of(secret), secret.clone());
        Ok(secret.clone())
    }

    async fn replace_secret(&self, secret: &Secret) -> client::Result<Secret> {
        let mut objects = self.lock();
        objects.record_write("replace", "secret", secret)?;
        objects.secrets.insert(key_of(secret), secret.clone());
        Ok(secret.clone())
    }
}

#[derive(Clone, Debug)]
struct Instance {
    project_id: String,
    /// Number of address polls that still report no address.
    booting_polls: u32,
    users: Vec<String>,
}

#[derive(Default)]
struct Remote {
    instances: BTreeMap<String, Instance>,
    deleted: Vec<(String, String)>,
    inserts: u32,
    /// Number of user inserts still answered with "unavailable".
    unavailable_user_inserts: u32,
}

/// A database API whose instances need a few polls before they report an address.
#[derive(Default)]
pub struct FakeAdmin {
    remote: Mutex<Remote>,
    booting_polls: u32,
}

impl FakeAdmin {
    pub fn booting_for(polls: u32) -> Self {
        Self {
            booting_polls: polls,
            ..Self::default()
        }
    }

    /// Answers the next `count` user inserts with "unavailable".
    pub fn refusing_users(self, count: u32) -> Self {
        self.lock().unavailable_user_inserts = count;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Remote> {
        self.remote.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn users_of(&self, instance: &str) -> Vec<String> {
        self.lock()
            .instances
            .get(instance)
            .map(|instance| instance.users.clone())
            .unwrap_or_default()
    }

    /// `(project, instance)` of every successful deletion.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.lock().deleted.clone()
    }

    pub fn insert_calls(&self) -> u32 {
        self.lock().inserts
    }
}

#[async_trait]
impl SqlAdmin for FakeAdmin {
    async fn insert_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> Result<(), RemoteError> {
        let mut remote = self.lock();
        remote.inserts += 1;
        if remote.instances.contains_key(&request.name) {
            return Err(RemoteError::Conflict {
                message: "instanceAlreadyExists".to_owned(),
            });
        }
        remote.instances.insert(
            request.name.clone(),
            Instance {
                project_id: project_id.to_owned(),
                booting_polls: self.booting_polls,
                users: Vec::new(),
            },
        );
        Ok(())
    }

    async fn delete_instance(&self, project_id: &str, instance: &str) -> Result<(), RemoteError> {
        let mut remote = self.lock();
        match remote.instances.remove(instance) {
            Some(_) => {
                remote
                    .deleted
                    .push((project_id.to_owned(), instance.to_owned()));
                Ok(())
            }
            None => Err(RemoteError::NotFound),
        }
    }

    async fn instance_address(
        &self,
        _project_id: &str,
        instance: &str,
    ) -> Result<Option<String>, RemoteError> {
        let mut remote = self.lock();
        let instance = remote
            .instances
            .get_mut(instance)
            .ok_or(RemoteError::NotFound)?;
        if instance.booting_polls > 0 {
            instance.booting_polls -= 1;
            return Ok(None);
        }
        Ok(Some(ADDRESS.to_owned()))
    }

    async fn insert_user(
        &self,
        _project_id: &str,
        instance: &str,
        username: &str,
        _password: &str,
    ) -> Result<(), RemoteError> {
        let mut remote = self.lock();
        if remote.unavailable_user_inserts > 0 {
            remote.unavailable_user_inserts -= 1;
            return Err(RemoteError::Unavailable {
                status: 503,
                message: "instance is not accepting users yet".to_owned(),
            });
        }
        let instance = remote
            .instances
            .get_mut(instance)
            .ok_or(RemoteError::NotFound)?;
        instance.users.push(username.to_owned());
        Ok(())
    }
}

/// Both reconcilers wired to the same fakes.
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub admin: Arc<FakeAdmin>,
    pub brokers: BrokerReconciler,
    pub workloads: WorkloadReconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_admin(FakeAdmin::booting_for(2))
    }

    pub fn with_admin(admin: FakeAdmin) -> Self {
        let store = Arc::new(FakeStore::default());
        let admin = Arc::new(admin);
        let secrets = Arc::new(SecretGenerator::seeded(42));
        let provisioner = Arc::new(Provisioner::new(
            admin.clone(),
            secrets.clone(),
            LinearBackoff::default(),
        ));
        let dyn_store: Arc<dyn ObjectStore> = store.clone();
        Self {
            brokers: BrokerReconciler::new(dyn_store.clone(), provisioner, PROJECT),
            workloads: WorkloadReconciler::new(dyn_store, secrets, PROJECT),
            store,
            admin,
        }
    }

    pub async fn reconcile_workload(&self, name: &str) -> Action {
        self.workloads
            .reconcile(&ObjectRef::new(name).within(NAMESPACE))
            .await
            .expect("workload reconciliation should succeed")
    }

    pub async fn reconcile_broker(&self, name: &str) -> Action {
        self.brokers
            .reconcile(&ObjectRef::new(name).within(NAMESPACE))
            .await
            .expect("broker reconciliation should succeed")
    }

    /// The only broker, panicking if there is not exactly one.
    pub fn only_broker(&self) -> DbBroker {
        let brokers = self.store.brokers();
        assert_eq!(brokers.len(), 1, "expected exactly one broker: {brokers:?}");
        brokers[0].clone()
    }
}

pub fn workload(name: &str, annotations: &[(&str, &str)], env: Vec<EnvVar>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(NAMESPACE.to_owned()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_owned(),
                        env: Some(env),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
                ..PodTemplateSpec::default()
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

pub fn env_names(workload: &Deployment) -> Vec<String> {
    workload
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|container| container.env.as_ref())
        .map(|env| env.iter().map(|entry| entry.name.clone()).collect())
        .unwrap_or_default()
}
