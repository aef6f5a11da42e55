//! Command line interface of the operator binary.
//!
//! Every argument can also be given through the environment variable of the same name in
//! `SCREAMING_SNAKE_CASE`, which is how the operator is usually configured in a cluster.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser};
use url::Url;

use crate::{
    namespace::WatchNamespace,
    provisioner::{
        DEFAULT_MAX_ATTEMPTS, LinearBackoff,
        cloud_sql::{CloudSqlConfig, DEFAULT_DATABASE_VERSION, DEFAULT_ENDPOINT, DEFAULT_TIER},
    },
};

#[derive(Debug, Parser)]
#[command(name = "db-broker-operator", author, version, about)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

/// The commands understood by the operator.
///
/// Generic over the arguments of [`Command::Run`] so tests can parse a reduced set.
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print the DbBroker CRD.
    Crd,

    /// Run the operator.
    Run(Run),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Project the database instances are created in, stamped into every new broker
    #[arg(long, env)]
    pub project_id: String,

    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Base URL of the Cloud SQL Admin API
    #[arg(long, env, default_value = DEFAULT_ENDPOINT)]
    pub cloud_sql_endpoint: Url,

    /// File holding the bearer token used to authenticate against the Cloud SQL Admin API
    #[arg(long, env, value_name = "FILE")]
    pub access_token_file: PathBuf,

    #[arg(long, env, default_value = DEFAULT_DATABASE_VERSION)]
    pub database_version: String,

    /// Machine tier of new database instances
    #[arg(long, env, default_value = DEFAULT_TIER)]
    pub tier: String,

    /// How often the address of a new instance is polled (and a user creation retried)
    /// before giving up
    #[arg(long, env, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Delay unit of the linear backoff, attempt `k` waits `k - 1` times this long
    #[arg(long, env, default_value = "10s", value_parser = humantime::parse_duration)]
    pub backoff_base: Duration,
}

impl RunArguments {
    pub fn cloud_sql_config(&self) -> CloudSqlConfig {
        CloudSqlConfig {
            endpoint: self.cloud_sql_endpoint.clone(),
            access_token_file: self.access_token_file.clone(),
            database_version: self.database_version.clone(),
            tier: self.tier.clone(),
        }
    }

    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.backoff_base, self.max_attempts)
    }
}
