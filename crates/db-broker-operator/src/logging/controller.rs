//! Reporting of reconciliation outcomes.

use std::error::Error;

use kube::{
    Resource,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use crate::{client::Client, logging::k8s_events};

/// Reconciler errors that can be grouped for logs and events.
pub trait ReconcilerError: Error {
    /// `PascalCase` name of the step that failed, used as the event reason.
    fn category(&self) -> &'static str;
}

/// Logs the outcome of one reconciliation. A failed reconciliation is also published as a
/// Warning event on the object, so it shows up next to the broker or workload.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource<DynamicType = ()>,
    ReconcileErr: ReconcilerError + 'static,
    QueueErr: Error + 'static,
{
    match result {
        Ok((object, action)) => {
            tracing::info!(
                controller.name = controller_name,
                %object,
                ?action,
                "reconciled"
            );
        }
        Err(controller::Error::ReconcilerFailed(error, object)) => {
            tracing::error!(
                controller.name = controller_name,
                %object,
                category = error.category(),
                error = error as &dyn Error,
                "reconciliation failed",
            );
            k8s_events::publish_failure(client, controller_name, error, object);
        }
        // Queue and watcher errors are not tied to a single object.
        Err(error) => {
            tracing::error!(
                controller.name = controller_name,
                error = error as &dyn Error,
                "controller failed",
            );
        }
    }
}
