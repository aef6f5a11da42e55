use std::sync::Arc;

use clap::Parser;
use db_broker_operator::{
    cli::{Command, Opts, RunArguments},
    client::{Client, FIELD_MANAGER},
    controller::{self, broker::BrokerReconciler, workload::WorkloadReconciler},
    crd::{self, DbBroker},
    logging,
    provisioner::{Provisioner, cloud_sql::CloudSqlAdmin},
    secret_gen::SecretGenerator,
    store::ObjectStore,
    utils::signal::{SignalError, SignalWatcher},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "db-broker-operator";
const LOG_ENV: &str = "DB_BROKER_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to print the CRD"))]
    PrintCrd { source: crd::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to watch for shutdown signals"))]
    WatchSignals { source: SignalError },

    #[snafu(display("failed to start the async runtime"))]
    StartRuntime { source: std::io::Error },
}

#[snafu::report]
fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.command {
        Command::Crd => {
            print!("{}", DbBroker::print_yaml().context(PrintCrdSnafu)?);
            Ok(())
        }
        Command::Run(args) => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context(StartRuntimeSnafu)?
            .block_on(run(args)),
    }
}

async fn run(args: RunArguments) -> Result<(), Error> {
    logging::initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        project_id = %args.project_id,
        watch_namespace = ?args.watch_namespace,
        "starting {APP_NAME}"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let client = Client::new(kube_client, Some(FIELD_MANAGER.to_owned()));
    let store: Arc<dyn ObjectStore> = Arc::new(client.clone());

    let secrets = Arc::new(SecretGenerator::from_os_rng());
    let admin = Arc::new(CloudSqlAdmin::new(args.cloud_sql_config()));
    let provisioner = Arc::new(Provisioner::new(admin, secrets.clone(), args.backoff()));

    let broker_reconciler = BrokerReconciler::new(store.clone(), provisioner, &args.project_id);
    let workload_reconciler = WorkloadReconciler::new(store, secrets, &args.project_id);

    let signals = SignalWatcher::shutdown_signals().context(WatchSignalsSnafu)?;

    futures::join!(
        controller::run_broker_controller(
            &client,
            &args.watch_namespace,
            broker_reconciler,
            signals.handle(),
        ),
        controller::run_workload_controller(
            &client,
            &args.watch_namespace,
            workload_reconciler,
            signals.handle(),
        ),
    );

    tracing::info!("all controllers stopped");
    Ok(())
}
