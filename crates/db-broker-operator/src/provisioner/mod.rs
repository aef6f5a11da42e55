//! Provisioning of remote database instances.
//!
//! [`SqlAdmin`] is the raw remote API. [`Provisioner`] wraps it with the semantics the
//! controllers rely on: idempotent creation, tolerant deletion and bounded polling with
//! [`LinearBackoff`] for operations that only succeed once the instance finished booting.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::{debug, info, warn};

use crate::secret_gen::SecretGenerator;

mod backoff;
pub mod cloud_sql;

pub use backoff::*;

/// Errors reported by the remote database API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RemoteError {
    /// The instance already exists, or another operation on it is still running.
    #[snafu(display("the request conflicts with the state of the database instance: {message}"))]
    Conflict { message: String },

    #[snafu(display("the database instance was not modified"))]
    NotModified,

    #[snafu(display("the requested object does not exist"))]
    NotFound,

    #[snafu(display("the request was rejected with status {status}: {message}"))]
    Rejected { status: u16, message: String },

    #[snafu(display("the database API is unavailable (status {status}): {message}"))]
    Unavailable { status: u16, message: String },

    #[snafu(display("failed to reach the database API"))]
    Transport { source: reqwest::Error },

    #[snafu(display("failed to read the access token from {path}"))]
    AccessToken {
        source: std::io::Error,
        path: String,
    },
}

impl RemoteError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. }
            | Self::Transport { .. }
            | Self::NotFound
            | Self::Conflict { .. } => true,
            Self::NotModified
            | Self::Rejected { .. }
            | Self::AccessToken { .. } => false,
        }
    }
}

/// Settings of a database instance to create.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    pub name: String,
    pub root_password: String,
}

/// The remote database provisioning API.
#[async_trait]
pub trait SqlAdmin: Send + Sync {
    async fn insert_instance(
        &self,
        project_id: &str,
        request: &InstanceRequest,
    ) -> Result<(), RemoteError>;

    async fn delete_instance(&self, project_id: &str, instance: &str) -> Result<(), RemoteError>;

    /// Returns the first address of the instance, or `None` while it has none yet.
    async fn instance_address(
        &self,
        project_id: &str,
        instance: &str,
    ) -> Result<Option<String>, RemoteError>;

    async fn insert_user(
        &self,
        project_id: &str,
        instance: &str,
        username: &str,
        password: &str,
    ) -> Result<(), RemoteError>;
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create database instance {instance:?}"))]
    CreateInstance {
        source: RemoteError,
        instance: String,
    },

    #[snafu(display("failed to delete database instance {instance:?}"))]
    DeleteInstance {
        source: RemoteError,
        instance: String,
    },

    #[snafu(display("failed to fetch the address of database instance {instance:?}"))]
    FetchAddress {
        source: RemoteError,
        instance: String,
    },

    #[snafu(display("failed to add a user to database instance {instance:?}"))]
    AddUser {
        source: RemoteError,
        instance: String,
    },

    #[snafu(display(
        "database instance {instance:?} is still not available after {attempts} attempts, giving up"
    ))]
    GaveUp { instance: String, attempts: u32 },
}

/// Credentials of a freshly created non-root database user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub struct Provisioner {
    admin: Arc<dyn SqlAdmin>,
    secrets: Arc<SecretGenerator>,
    backoff: LinearBackoff,
}

impl Provisioner {
    pub fn new(
        admin: Arc<dyn SqlAdmin>,
        secrets: Arc<SecretGenerator>,
        backoff: LinearBackoff,
    ) -> Self {
        Self {
            admin,
            secrets,
            backoff,
        }
    }

    /// Creates the instance and returns its new root password.
    ///
    /// Returns `Ok(None)` if the instance already existed, in which case no new password was
    /// set and the caller has to keep whatever root password it stored before.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, project_id: &str, instance: &str) -> Result<Option<String>, Error> {
        let request = InstanceRequest {
            name: instance.to_owned(),
            root_password: self.secrets.password(),
        };

        info!("creating database instance");
        match self.admin.insert_instance(project_id, &request).await {
            Ok(()) => {
                info!("database instance created");
                Ok(Some(request.root_password))
            }
            // For an insert, a conflict means the instance is already there.
            Err(err @ (RemoteError::Conflict { .. } | RemoteError::NotModified)) => {
                info!(reason = %err, "database instance already existed");
                Ok(None)
            }
            Err(source) => Err(Error::CreateInstance {
                source,
                instance: instance.to_owned(),
            }),
        }
    }

    /// Deletes the instance. An instance that does not exist counts as deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, project_id: &str, instance: &str) -> Result<(), Error> {
        match self.admin.delete_instance(project_id, instance).await {
            Ok(()) => {
                info!("database instance deleted");
                Ok(())
            }
            Err(RemoteError::NotFound) => {
                debug!("database instance was already gone");
                Ok(())
            }
            Err(source) => Err(Error::DeleteInstance {
                source,
                instance: instance.to_owned(),
            }),
        }
    }

    /// Polls the instance until it reports an address.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_address(&self, project_id: &str, instance: &str) -> Result<String, Error> {
        for (attempt, delay) in self.backoff.attempts() {
            tokio::time::sleep(delay).await;

            match self.admin.instance_address(project_id, instance).await {
                Ok(Some(address)) => {
                    info!(attempt, %address, "database address fetched");
                    return Ok(address);
                }
                Ok(None) => {
                    warn!(attempt, "database instance has no address yet");
                }
                Err(source) if source.is_transient() => {
                    warn!(
                        attempt,
                        error = &source as &dyn std::error::Error,
                        "database instance is not initialised yet"
                    );
                }
                Err(source) => {
                    return Err(Error::FetchAddress {
                        source,
                        instance: instance.to_owned(),
                    });
                }
            }
        }

        Err(self.gave_up(instance))
    }

    /// Creates a non-root user with a random name and password.
    #[tracing::instrument(skip(self))]
    pub async fn add_user(&self, project_id: &str, instance: &str) -> Result<Credentials, Error> {
        for (attempt, delay) in self.backoff.attempts() {
            tokio::time::sleep(delay).await;

            let credentials = Credentials {
                username: self.secrets.username(),
                password: self.secrets.password(),
            };
            match self
                .admin
                .insert_user(
                    project_id,
                    instance,
                    &credentials.username,
                    &credentials.password,
                )
                .await
            {
                Ok(()) => {
                    info!(attempt, username = %credentials.username, "database user added");
                    return Ok(credentials);
                }
                Err(source) if source.is_transient() => {
                    warn!(
                        attempt,
                        error = &source as &dyn std::error::Error,
                        "failed to add database user, instance is probably still starting"
                    );
                }
                Err(source) => {
                    return Err(Error::AddUser {
                        source,
                        instance: instance.to_owned(),
                    });
                }
            }
        }

        Err(self.gave_up(instance))
    }

    fn gave_up(&self, instance: &str) -> Error {
        Error::GaveUp {
            instance: instance.to_owned(),
            attempts: self.backoff.max_attempts,
        }
    }
}
