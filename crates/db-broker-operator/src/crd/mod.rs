//! The `DbBroker` custom resource and the well-known keys shared by both controllers.

use const_format::concatcp;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const API_GROUP: &str = "dbbroker.io";
pub const API_VERSION: &str = "v1beta1";

/// Annotation opting a workload into database management. Only the value
/// [`MANAGED_ANNOTATION_VALUE`] counts.
pub const MANAGED_ANNOTATION_KEY: &str = "dbbroker";
pub const MANAGED_ANNOTATION_VALUE: &str = "managed";

/// Annotation toggling whether a managed workload currently needs a database. Anything other
/// than [`DB_REQUIRED_ANNOTATION_VALUE`] (including absence) means "not required".
pub const DB_REQUIRED_ANNOTATION_KEY: &str = "dbbroker-db-required";
pub const DB_REQUIRED_ANNOTATION_VALUE: &str = "true";

/// Label binding a broker to the name of the workload that requested it.
pub const WORKLOAD_LABEL_KEY: &str = "deployment";

/// Label put on every credential secret, so the broker controller only watches those.
pub const CREDENTIALS_LABEL_KEY: &str = concatcp!(API_GROUP, "/credentials");
pub const CREDENTIALS_LABEL_VALUE: &str = "true";
pub const CREDENTIALS_LABEL_SELECTOR: &str =
    concatcp!(CREDENTIALS_LABEL_KEY, "=", CREDENTIALS_LABEL_VALUE);

/// Finalizer holding a broker until its remote database instance is deleted.
pub const CLEANUP_FINALIZER: &str = concatcp!(API_GROUP, "/database-cleanup");

/// Length of the random suffix appended to the workload name to form a broker name.
pub const BROKER_NAME_SUFFIX_LENGTH: usize = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize the DbBroker CRD"))]
    SerializeCrd { source: serde_yaml::Error },
}

/// A record stating that a database should exist for a workload.
///
/// The spec is written once by the workload controller and never changed afterwards. The
/// status is owned by the broker controller; `ready` only ever goes from `false` to `true`.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "dbbroker.io",
    version = "v1beta1",
    kind = "DbBroker",
    namespaced,
    status = "DbBrokerStatus",
    shortname = "dbb",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadName"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbBrokerSpec {
    /// Name of the workload (Deployment) the database is provisioned for.
    pub workload_name: String,

    /// Namespace of the workload.
    pub workload_namespace: String,

    /// Project (account) the database instance is created in.
    pub project_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbBrokerStatus {
    /// Set once provisioning completed. Never reset.
    #[serde(default)]
    pub ready: bool,

    /// Name of the non-root database user.
    #[serde(default)]
    pub username: String,

    /// Connection address of the database instance.
    #[serde(default)]
    pub endpoint: String,
}

impl DbBroker {
    /// Name of the remote database instance backing this broker.
    pub fn instance_name(&self) -> String {
        instance_name(&self.spec.workload_name, &self.spec.workload_namespace)
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.ready)
    }

    /// The credential secret shares its name with the broker.
    pub fn secret_name(&self) -> String {
        self.name_any()
    }

    pub fn print_yaml() -> Result<String, Error> {
        use kube::CustomResourceExt;

        serde_yaml::to_string(&Self::crd()).context(SerializeCrdSnafu)
    }
}

/// Remote database instances are named after the workload, not the broker, so that a
/// re-created broker finds the same instance.
pub fn instance_name(workload_name: &str, workload_namespace: &str) -> String {
    format!("{workload_name}-{workload_namespace}")
}

/// Recovers the workload name from a broker name of the form `<workload>-<suffix>`.
pub fn workload_name_from_broker_name(broker_name: &str) -> Option<&str> {
    broker_name
        .rsplit_once('-')
        .filter(|(workload, suffix)| {
            !workload.is_empty() && suffix.len() == BROKER_NAME_SUFFIX_LENGTH
        })
        .map(|(workload, _)| workload)
}
