//! Creates and deletes the [`DbBroker`] of a workload according to its annotations and
//! publishes the connection details once the broker is ready.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Resource, ResourceExt,
    runtime::{controller::Action, reflector::ObjectRef},
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    client,
    controller::Reconciler,
    crd::{
        BROKER_NAME_SUFFIX_LENGTH, DB_REQUIRED_ANNOTATION_KEY, DB_REQUIRED_ANNOTATION_VALUE,
        DbBroker, DbBrokerSpec, MANAGED_ANNOTATION_KEY, MANAGED_ANNOTATION_VALUE,
        WORKLOAD_LABEL_KEY,
    },
    env::{self, RequiredEnv},
    finalizer,
    logging::controller::ReconcilerError,
    secret_gen::SecretGenerator,
    store::ObjectStore,
};

/// How long to wait for a broker that is being deleted before a replacement is created.
pub const DELETING_BROKER_REQUEUE_DELAY: Duration = Duration::from_secs(5);

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("workload {name:?} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to get workload"))]
    GetWorkload { source: client::Error },

    #[snafu(display("failed to update workload"))]
    UpdateWorkload { source: client::Error },

    #[snafu(display("failed to list DbBrokers"))]
    ListBrokers { source: client::Error },

    #[snafu(display("failed to create DbBroker"))]
    CreateBroker { source: client::Error },

    #[snafu(display("failed to delete DbBroker {name:?}"))]
    DeleteBroker { source: client::Error, name: String },

    #[snafu(display("failed to locate the injection target"))]
    InjectionTarget { source: env::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Whether the workload opted into database management.
pub fn is_managed(workload: &Deployment) -> bool {
    workload
        .annotations()
        .get(MANAGED_ANNOTATION_KEY)
        .is_some_and(|value| value == MANAGED_ANNOTATION_VALUE)
}

/// Whether the workload currently wants a database.
pub fn is_db_required(workload: &Deployment) -> bool {
    workload
        .annotations()
        .get(DB_REQUIRED_ANNOTATION_KEY)
        .is_some_and(|value| value == DB_REQUIRED_ANNOTATION_VALUE)
}

pub struct WorkloadReconciler {
    store: Arc<dyn ObjectStore>,
    secrets: Arc<SecretGenerator>,
    project_id: String,
}

impl WorkloadReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        secrets: Arc<SecretGenerator>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            secrets,
            project_id: project_id.into(),
        }
    }

    #[tracing::instrument(
        skip(self, key),
        fields(workload.name = %key.name, workload.namespace = ?key.namespace),
    )]
    async fn reconcile_workload(&self, key: &ObjectRef<Deployment>) -> Result<Action, Error> {
        let namespace = key
            .namespace
            .as_deref()
            .context(ObjectHasNoNamespaceSnafu {
                name: key.name.clone(),
            })?;

        // The brokers of a deleted workload are garbage collected through their owner reference.
        let Some(workload) = self.store.get_workload(key).await.context(GetWorkloadSnafu)? else {
            debug!("workload is gone");
            return Ok(Action::await_change());
        };

        if !is_managed(&workload) {
            debug!("workload is not managed");
            return Ok(Action::await_change());
        }

        if is_db_required(&workload) {
            self.require_database(workload, namespace).await
        } else {
            self.release_database(workload, namespace).await
        }
    }

    /// Strips the connection variables first. The brokers are only deleted once a later
    /// reconciliation sees a workload without them, so running pods never reference a
    /// credential secret that is already gone.
    async fn release_database(
        &self,
        mut workload: Deployment,
        namespace: &str,
    ) -> Result<Action, Error> {
        let stripped = match env::first_container_env(&mut workload) {
            Ok(env) => env::strip_injected(env),
            // Nothing can have been injected into a workload without containers.
            Err(_) => false,
        };
        if stripped {
            info!("removing database connection from workload");
            self.store
                .replace_workload(&workload)
                .await
                .context(UpdateWorkloadSnafu)?;
            return Ok(Action::await_change());
        }

        let name = workload.name_any();
        let brokers = self
            .store
            .list_brokers(namespace, &name)
            .await
            .context(ListBrokersSnafu)?;
        for broker in brokers
            .iter()
            .filter(|broker| !finalizer::has_deletion_stamp(*broker))
        {
            info!(dbbroker.name = %broker.name_any(), "database no longer required, deleting DbBroker");
            self.store
                .delete_broker(broker)
                .await
                .context(DeleteBrokerSnafu {
                    name: broker.name_any(),
                })?;
        }
        Ok(Action::await_change())
    }

    async fn require_database(
        &self,
        mut workload: Deployment,
        namespace: &str,
    ) -> Result<Action, Error> {
        let name = workload.name_any();
        let brokers = self
            .store
            .list_brokers(namespace, &name)
            .await
            .context(ListBrokersSnafu)?;
        let (deleting, live): (Vec<_>, Vec<_>) = brokers
            .iter()
            .partition(|broker| finalizer::has_deletion_stamp(*broker));

        if live.is_empty() {
            if !deleting.is_empty() {
                info!(
                    deleting = deleting.len(),
                    "waiting for the previous DbBroker to be deleted"
                );
                return Ok(Action::requeue(DELETING_BROKER_REQUEUE_DELAY));
            }
            let broker = self.new_broker(&workload, namespace);
            info!(dbbroker.name = %broker.name_any(), "creating DbBroker");
            self.store
                .create_broker(&broker)
                .await
                .context(CreateBrokerSnafu)?;
            return Ok(Action::await_change());
        }

        if live.len() > 1 {
            warn!(
                brokers = ?live.iter().map(|broker| broker.name_any()).collect::<Vec<_>>(),
                "workload has more than one DbBroker"
            );
        }
        let Some(broker) = live.iter().find(|broker| broker.is_ready()) else {
            debug!("waiting for the DbBroker to become ready");
            return Ok(Action::await_change());
        };
        let Some(status) = broker.status.as_ref() else {
            return Ok(Action::await_change());
        };

        let required =
            RequiredEnv::for_broker(&broker.secret_name(), &status.username, &status.endpoint);
        let env = env::first_container_env(&mut workload).context(InjectionTargetSnafu)?;
        if env::inject_missing(env, &required) {
            info!(dbbroker.name = %broker.name_any(), "injecting database connection into workload");
            self.store
                .replace_workload(&workload)
                .await
                .context(UpdateWorkloadSnafu)?;
        }
        Ok(Action::await_change())
    }

    fn new_broker(&self, workload: &Deployment, namespace: &str) -> DbBroker {
        let workload_name = workload.name_any();
        let suffix = self.secrets.lowercase(BROKER_NAME_SUFFIX_LENGTH);
        let mut broker = DbBroker::new(
            &format!("{workload_name}-{suffix}"),
            DbBrokerSpec {
                workload_name: workload_name.clone(),
                workload_namespace: namespace.to_owned(),
                project_id: self.project_id.clone(),
            },
        );
        broker.metadata.namespace = Some(namespace.to_owned());
        broker.metadata.labels = Some(BTreeMap::from([(
            WORKLOAD_LABEL_KEY.to_owned(),
            workload_name,
        )]));
        broker.metadata.owner_references = workload.controller_owner_ref(&()).map(|owner| vec![owner]);
        broker
    }
}

#[async_trait]
impl Reconciler for WorkloadReconciler {
    type Error = Error;
    type Resource = Deployment;

    async fn reconcile(&self, key: &ObjectRef<Deployment>) -> Result<Action, Error> {
        self.reconcile_workload(key).await
    }
}
