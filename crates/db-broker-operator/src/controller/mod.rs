//! The reconciliation loops and the glue that connects them to [`kube::runtime::Controller`].

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, future};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Secret};
use kube::{
    Resource,
    runtime::{
        Controller,
        controller::Action,
        reflector::ObjectRef,
        watcher,
    },
};
use serde::de::DeserializeOwned;

use crate::{
    client::Client,
    crd::{CREDENTIALS_LABEL_SELECTOR, DbBroker},
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
};

pub mod broker;
pub mod workload;

pub const BROKER_CONTROLLER_NAME: &str = "dbbroker";
pub const WORKLOAD_CONTROLLER_NAME: &str = "workload";

/// How long a failed reconciliation waits before it is retried.
pub const ERROR_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// One reconciliation loop.
///
/// A reconciler receives only the key of the object that changed and reads the current state
/// itself, so it also sees objects that disappeared in the meantime.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Resource: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    type Error: ReconcilerError + Send + Sync + 'static;

    async fn reconcile(&self, key: &ObjectRef<Self::Resource>) -> Result<Action, Self::Error>;

    fn error_policy(&self, _error: &Self::Error) -> Action {
        Action::requeue(ERROR_REQUEUE_DELAY)
    }
}

/// Drives `controller` with `reconciler` until the controller shuts down, reporting every
/// outcome.
pub async fn run_controller<R: Reconciler>(
    controller: Controller<R::Resource>,
    reconciler: Arc<R>,
    client: &Client,
    name: &str,
) {
    controller
        .run(
            |object, reconciler: Arc<R>| async move {
                reconciler.reconcile(&ObjectRef::from_obj(&*object)).await
            },
            |_object, error, reconciler: Arc<R>| reconciler.error_policy(error),
            reconciler,
        )
        .for_each(|result| {
            report_controller_reconciled(client, name, &result);
            future::ready(())
        })
        .await;
}

/// Runs the broker controller, which also watches the credential secrets it owns.
pub async fn run_broker_controller<F>(
    client: &Client,
    watch_namespace: &WatchNamespace,
    reconciler: broker::BrokerReconciler,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    tracing::info!(controller.name = BROKER_CONTROLLER_NAME, "starting controller");
    let controller = Controller::new(
        watch_namespace.get_api::<DbBroker>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<Secret>(client),
        watcher::Config::default().labels(CREDENTIALS_LABEL_SELECTOR),
    )
    .graceful_shutdown_on(shutdown);

    run_controller(controller, Arc::new(reconciler), client, BROKER_CONTROLLER_NAME).await;
}

/// Runs the workload controller, which is re-triggered whenever one of its brokers changes.
pub async fn run_workload_controller<F>(
    client: &Client,
    watch_namespace: &WatchNamespace,
    reconciler: workload::WorkloadReconciler,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    tracing::info!(controller.name = WORKLOAD_CONTROLLER_NAME, "starting controller");
    let controller = Controller::new(
        watch_namespace.get_api::<Deployment>(client),
        watcher::Config::default(),
    )
    .owns(
        watch_namespace.get_api::<DbBroker>(client),
        watcher::Config::default(),
    )
    .graceful_shutdown_on(shutdown);

    run_controller(
        controller,
        Arc::new(reconciler),
        client,
        WORKLOAD_CONTROLLER_NAME,
    )
    .await;
}
