//! Synchronizes the environment of a workload's first container with the connection details
//! of its database.
//!
//! All functions here only touch the in-memory list they are given. Variables are matched by
//! name only, so a variable the user edited by hand is left alone.

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Container, EnvVar, EnvVarSource, SecretKeySelector},
};
use snafu::{OptionExt, Snafu};

use crate::credentials::{NO_ROOT_PASSWORD_KEY, ROOT_PASSWORD_KEY};

pub const DB_USERNAME: &str = "DB_USERNAME";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_PASSWORD_NO_ROOT: &str = "DB_PASSWORD_NO_ROOT";
pub const DB_ENDPOINT: &str = "DB_ENDPOINT";

/// The injected variable names, in the order they are appended.
pub const INJECTED_ENV_NAMES: [&str; 4] =
    [DB_USERNAME, DB_PASSWORD, DB_PASSWORD_NO_ROOT, DB_ENDPOINT];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("workload {workload:?} has no container to inject the database into"))]
    NoContainer { workload: String },
}

pub fn env_var_from_value(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_var_from_secret(
    env_var_name: impl Into<String>,
    secret_name: impl Into<String>,
    secret_key: impl Into<String>,
) -> EnvVar {
    EnvVar {
        name: env_var_name.into(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.into(),
                key: secret_key.into(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The variables a workload needs to reach its database, in canonical order.
#[derive(Clone, Debug, PartialEq)]
pub struct RequiredEnv {
    entries: Vec<EnvVar>,
}

impl RequiredEnv {
    /// Username and endpoint are literal values, both passwords are read from the credential
    /// secret of the broker.
    pub fn for_broker(secret_name: &str, username: &str, endpoint: &str) -> Self {
        Self {
            entries: vec![
                env_var_from_value(DB_USERNAME, username),
                env_var_from_secret(DB_PASSWORD, secret_name, ROOT_PASSWORD_KEY),
                env_var_from_secret(DB_PASSWORD_NO_ROOT, secret_name, NO_ROOT_PASSWORD_KEY),
                env_var_from_value(DB_ENDPOINT, endpoint),
            ],
        }
    }

    pub fn entries(&self) -> &[EnvVar] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }
}

fn is_present(env: &[EnvVar], name: &str) -> bool {
    env.iter().any(|entry| entry.name == name)
}

/// Appends every required variable that is not present yet. Returns whether anything was
/// appended.
pub fn inject_missing(env: &mut Vec<EnvVar>, required: &RequiredEnv) -> bool {
    let mut changed = false;
    for entry in required.entries() {
        if !is_present(env, &entry.name) {
            tracing::debug!(env.name = %entry.name, "injecting missing env var");
            env.push(entry.clone());
            changed = true;
        }
    }
    changed
}

/// Removes the first variable called `name`, keeping the order of all others.
pub fn remove_if_present(env: &mut Vec<EnvVar>, name: &str) -> bool {
    match env.iter().position(|entry| entry.name == name) {
        Some(index) => {
            tracing::debug!(env.name = name, "removing injected env var");
            env.remove(index);
            true
        }
        None => false,
    }
}

/// Removes all injected variables. Returns whether at least one was present.
pub fn strip_injected(env: &mut Vec<EnvVar>) -> bool {
    INJECTED_ENV_NAMES
        .iter()
        .fold(false, |removed, name| remove_if_present(env, name) || removed)
}

/// The environment of the first container of the workload's pod template, which is the only
/// injection target.
pub fn first_container_env(deployment: &mut Deployment) -> Result<&mut Vec<EnvVar>, Error> {
    let workload = deployment.metadata.name.clone().unwrap_or_default();
    let container: &mut Container = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod| pod.containers.first_mut())
        .context(NoContainerSnafu { workload })?;
    Ok(container.env.get_or_insert_with(Vec::new))
}
