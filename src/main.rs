//! irsa-operator - binds cluster service accounts to AWS IAM roles

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use irsa_operator::config::OperatorConfig;
use irsa_operator::controller::{error_policy, reconcile, Context};
use irsa_operator::crd::IamRoleServiceAccount;
use irsa_operator::iam::IamClient;

/// irsa-operator - Kubernetes operator binding service accounts to AWS IAM roles
#[derive(Parser, Debug)]
#[command(name = "irsa-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to the operator configuration file
    #[arg(long, env = "IRSA_OPERATOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&IamRoleServiceAccount::crd())
            .context("failed to serialize CRD")?;
        println!("{crd}");
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config (or IRSA_OPERATOR_CONFIG) is required")?;
    let config = OperatorConfig::load(&config_path)?;
    config.validate()?;
    info!(path = %config_path.display(), cluster = %config.cluster_name, "loaded configuration");

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let iam = IamClient::new(&config).await;
    let ctx = Arc::new(Context::new(client.clone(), Arc::new(iam), &config));

    let irsas = Api::<IamRoleServiceAccount>::all(client.clone());
    let service_accounts = Api::<ServiceAccount>::all(client);

    info!("starting irsa controller");
    Controller::new(irsas, watcher::Config::default())
        .owns(service_accounts, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(object) => info!(?object, "reconciled"),
                Err(err) => warn!(%err, "reconcile failed"),
            }
        })
        .await;
    info!("controller terminated");

    Ok(())
}
