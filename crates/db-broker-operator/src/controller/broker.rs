//! Provisions the database instance of a [`DbBroker`] and tears it down again.
//!
//! A broker that is not ready runs the full provisioning sequence on every reconciliation:
//! create the instance, wait for its address, create a non-root user, store the passwords in
//! the credential secret, record username and address in the status, inject the connection
//! variables into the workload and finally mark the broker ready. Each step is idempotent, so
//! a sequence that failed halfway is simply re-run.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
use kube::{
    ResourceExt,
    runtime::{controller::Action, reflector::ObjectRef},
};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, warn};

use crate::{
    client,
    controller::Reconciler,
    credentials::{self, NO_ROOT_PASSWORD_KEY},
    crd::{self, CLEANUP_FINALIZER, DbBroker, DbBrokerStatus},
    env::{self, RequiredEnv},
    finalizer,
    logging::controller::ReconcilerError,
    provisioner::{self, Provisioner},
    store::ObjectStore,
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("DbBroker {name:?} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("failed to get DbBroker"))]
    GetBroker { source: client::Error },

    #[snafu(display("failed to list the DbBrokers of workload {workload:?}"))]
    ListSiblings {
        source: client::Error,
        workload: String,
    },

    #[snafu(display("failed to update the finalizers of DbBroker"))]
    UpdateFinalizers { source: client::Error },

    #[snafu(display("failed to provision the database instance"))]
    Provision { source: provisioner::Error },

    #[snafu(display("failed to delete the database instance"))]
    DeleteInstance { source: provisioner::Error },

    #[snafu(display("failed to get credential secret"))]
    GetSecret { source: client::Error },

    #[snafu(display("failed to write credential secret"))]
    WriteSecret { source: client::Error },

    #[snafu(display("failed to update DbBroker status"))]
    UpdateStatus { source: client::Error },

    #[snafu(display("failed to get workload"))]
    GetWorkload { source: client::Error },

    #[snafu(display("workload {workload:?} does not exist in namespace {namespace:?}"))]
    WorkloadNotFound { workload: String, namespace: String },

    #[snafu(display("failed to locate the injection target"))]
    InjectionTarget { source: env::Error },

    #[snafu(display("failed to update workload"))]
    UpdateWorkload { source: client::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub struct BrokerReconciler {
    store: Arc<dyn ObjectStore>,
    provisioner: Arc<Provisioner>,
    /// Project used when the broker is gone and its spec can no longer be read.
    project_id: String,
}

impl BrokerReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        provisioner: Arc<Provisioner>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provisioner,
            project_id: project_id.into(),
        }
    }

    #[tracing::instrument(
        skip(self, key),
        fields(dbbroker.name = %key.name, dbbroker.namespace = ?key.namespace),
    )]
    async fn reconcile_broker(&self, key: &ObjectRef<DbBroker>) -> Result<Action, Error> {
        let namespace = key
            .namespace
            .as_deref()
            .context(ObjectHasNoNamespaceSnafu {
                name: key.name.clone(),
            })?;

        match self.store.get_broker(key).await.context(GetBrokerSnafu)? {
            None => self.cleanup_vanished(&key.name, namespace).await,
            Some(broker) if finalizer::has_deletion_stamp(&broker) => self.finalize(broker).await,
            Some(broker) => self.provision(broker).await,
        }
    }

    /// The broker disappeared without passing through [`Self::finalize`], e.g. because its
    /// finalizer was removed by hand.
    async fn cleanup_vanished(&self, name: &str, namespace: &str) -> Result<Action, Error> {
        let Some(workload) = crd::workload_name_from_broker_name(name) else {
            warn!("vanished DbBroker name does not identify a workload, not deleting anything");
            return Ok(Action::await_change());
        };
        if self.has_live_sibling(namespace, workload, None).await? {
            return Ok(Action::await_change());
        }

        let instance = crd::instance_name(workload, namespace);
        info!(%instance, "DbBroker is gone, deleting its database instance");
        self.provisioner
            .delete(&self.project_id, &instance)
            .await
            .context(DeleteInstanceSnafu)?;
        Ok(Action::await_change())
    }

    async fn finalize(&self, broker: DbBroker) -> Result<Action, Error> {
        let Some(finalizers) = finalizer::without_finalizer(&broker, CLEANUP_FINALIZER) else {
            debug!("DbBroker is being deleted and was already cleaned up");
            return Ok(Action::await_change());
        };

        let namespace = broker.namespace().unwrap_or_default();
        if !self
            .has_live_sibling(&namespace, &broker.spec.workload_name, Some(&broker))
            .await?
        {
            let instance = broker.instance_name();
            info!(%instance, "DbBroker is being deleted, deleting its database instance");
            self.provisioner
                .delete(&broker.spec.project_id, &instance)
                .await
                .context(DeleteInstanceSnafu)?;
        }

        self.store
            .patch_broker_finalizers(&broker, finalizers)
            .await
            .context(UpdateFinalizersSnafu)?;
        Ok(Action::await_change())
    }

    /// Instances are named after the workload, so a replacement broker of the same workload
    /// shares the instance and it must survive.
    async fn has_live_sibling(
        &self,
        namespace: &str,
        workload: &str,
        this: Option<&DbBroker>,
    ) -> Result<bool, Error> {
        let siblings = self
            .store
            .list_brokers(namespace, workload)
            .await
            .context(ListSiblingsSnafu { workload })?;
        let live = siblings.iter().find(|sibling| {
            !finalizer::has_deletion_stamp(*sibling)
                && this.is_none_or(|this| this.name_any() != sibling.name_any())
        });
        if let Some(live) = live {
            info!(
                sibling = %live.name_any(),
                "another DbBroker still uses the database instance, keeping it"
            );
        }
        Ok(live.is_some())
    }

    async fn provision(&self, mut broker: DbBroker) -> Result<Action, Error> {
        if let Some(finalizers) = finalizer::with_finalizer(&broker, CLEANUP_FINALIZER) {
            broker = self
                .store
                .patch_broker_finalizers(&broker, finalizers)
                .await
                .context(UpdateFinalizersSnafu)?;
        }

        if broker.is_ready() {
            debug!("DbBroker is ready, nothing to do");
            return Ok(Action::await_change());
        }

        let project_id = broker.spec.project_id.clone();
        let instance = broker.instance_name();
        let namespace = broker.namespace().unwrap_or_default();
        let current_status = broker.status.clone().unwrap_or_default();

        let root_password = self
            .provisioner
            .create(&project_id, &instance)
            .await
            .context(ProvisionSnafu)?;
        let endpoint = self
            .provisioner
            .fetch_address(&project_id, &instance)
            .await
            .context(ProvisionSnafu)?;

        let existing_secret = self
            .store
            .get_secret(&namespace, &broker.secret_name())
            .await
            .context(GetSecretSnafu)?;

        // A user whose name is in the status and whose password is in the secret may already
        // have been handed out, so it is reused.
        let recorded_user = Some(current_status.username.clone()).filter(|username| {
            !username.is_empty()
                && existing_secret.as_ref().is_some_and(|secret| {
                    credentials::stored_value(secret, NO_ROOT_PASSWORD_KEY).is_some()
                })
        });
        let (username, new_password) = match recorded_user {
            Some(username) => {
                debug!(%username, "reusing recorded database user");
                (username, None)
            }
            None => {
                let user = self
                    .provisioner
                    .add_user(&project_id, &instance)
                    .await
                    .context(ProvisionSnafu)?;
                (user.username, Some(user.password))
            }
        };

        self.write_secret(
            &broker,
            existing_secret,
            root_password.as_deref(),
            new_password.as_deref(),
        )
        .await?;

        let mut status = DbBrokerStatus {
            ready: false,
            username,
            endpoint,
        };
        if status != current_status {
            broker = self
                .store
                .patch_broker_status(&broker, &status)
                .await
                .context(UpdateStatusSnafu)?;
        }

        self.inject_into_workload(&broker, &status).await?;

        status.ready = true;
        self.store
            .patch_broker_status(&broker, &status)
            .await
            .context(UpdateStatusSnafu)?;
        info!(endpoint = %status.endpoint, "DbBroker is ready");

        Ok(Action::await_change())
    }

    async fn write_secret(
        &self,
        broker: &DbBroker,
        existing: Option<Secret>,
        root_password: Option<&str>,
        no_root_password: Option<&str>,
    ) -> Result<(), Error> {
        let data =
            credentials::merge_credentials(existing.as_ref(), root_password, no_root_password);
        match existing {
            None => {
                info!("creating credential secret");
                self.store
                    .create_secret(&credentials::build_secret(broker, data))
                    .await
                    .context(WriteSecretSnafu)?;
            }
            Some(secret) if secret.data.as_ref() == Some(&data) => {
                debug!("credential secret is up to date");
            }
            Some(mut secret) => {
                info!("updating credential secret");
                secret.data = Some(data);
                self.store
                    .replace_secret(&secret)
                    .await
                    .context(WriteSecretSnafu)?;
            }
        }
        Ok(())
    }

    async fn inject_into_workload(
        &self,
        broker: &DbBroker,
        status: &DbBrokerStatus,
    ) -> Result<(), Error> {
        let workload = &broker.spec.workload_name;
        let namespace = &broker.spec.workload_namespace;
        let key = ObjectRef::<Deployment>::new(workload).within(namespace);

        let mut deployment = self
            .store
            .get_workload(&key)
            .await
            .context(GetWorkloadSnafu)?
            .context(WorkloadNotFoundSnafu {
                workload: workload.clone(),
                namespace: namespace.clone(),
            })?;

        let required =
            RequiredEnv::for_broker(&broker.secret_name(), &status.username, &status.endpoint);
        let env = env::first_container_env(&mut deployment).context(InjectionTargetSnafu)?;
        if env::inject_missing(env, &required) {
            info!(%workload, "injecting database connection into workload");
            self.store
                .replace_workload(&deployment)
                .await
                .context(UpdateWorkloadSnafu)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for BrokerReconciler {
    type Error = Error;
    type Resource = DbBroker;

    async fn reconcile(&self, key: &ObjectRef<DbBroker>) -> Result<Action, Error> {
        self.reconcile_broker(key).await
    }
}
