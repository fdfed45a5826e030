use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use iam_rotator::config::{self, CredentialFields, RotationConfig};
use iam_rotator::registry::{EcrTokenSource, RegistryRefresher};
use iam_rotator::rotation::{
    RotationContext, RotationRunner, TokioPause, SETUP_FAILURE_EXIT_CODE,
};
use iam_rotator::{IamSessionFactory, KubernetesSecretStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Rotates IAM access keys stored in Kubernetes secrets.
#[derive(Parser)]
#[command(name = "rotate-iam", version)]
struct Cli {
    /// Namespace to search for labeled secrets. Defaults to the client's namespace.
    #[arg(long, short, global = true, env = "NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rotate the access key of every secret labeled for rotation.
    Rotate,
    /// Refresh registry pull secrets from their annotated access key secrets.
    UpdateEcr,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let run_id = uuid::Uuid::new_v4();
    let namespace = cli.namespace.or_else(|| config::NAMESPACE.clone());

    let store = match connect_store(namespace).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), %run_id, "setup failed");
            return exit_code(SETUP_FAILURE_EXIT_CODE);
        }
    };

    match cli.command {
        Command::Rotate => rotate(store, run_id).await,
        Command::UpdateEcr => update_ecr(store, run_id).await,
    }
}

async fn connect_store(namespace: Option<String>) -> anyhow::Result<Arc<KubernetesSecretStore>> {
    let store = KubernetesSecretStore::connect(namespace, CredentialFields::from_env())
        .await
        .context("unable to build kubernetes client")?;
    Ok(Arc::new(store))
}

async fn rotate(store: Arc<KubernetesSecretStore>, run_id: uuid::Uuid) -> ExitCode {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(%run_id, "interrupt received; finishing in-flight rotations");
            on_signal.cancel();
        }
    });

    let ctx = RotationContext {
        store,
        sessions: Arc::new(IamSessionFactory::new(config::AWS_REGION.as_str())),
        pause: Arc::new(TokioPause),
        config: RotationConfig::from_env(),
        cancel,
    };
    tracing::info!(%run_id, label = %ctx.config.label, "starting rotation run");

    let report = match RotationRunner::new(ctx).run().await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(%err, %run_id, "unable to list secrets");
            return exit_code(SETUP_FAILURE_EXIT_CODE);
        }
    };
    for line in report.summary_lines() {
        println!("{line}");
    }
    exit_code(report.status().exit_code())
}

async fn update_ecr(store: Arc<KubernetesSecretStore>, run_id: uuid::Uuid) -> ExitCode {
    let refresher = RegistryRefresher::new(
        store,
        Arc::new(EcrTokenSource),
        config::ECR_UPDATER_LABEL.as_str(),
        config::ECR_DOCKER_EMAIL.as_str(),
        Duration::from_secs(*config::ROTATION_CALL_TIMEOUT_SECS),
    );
    tracing::info!(%run_id, "starting registry secret refresh");

    let report = match refresher.run().await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(%err, %run_id, "unable to list registry secrets");
            return exit_code(SETUP_FAILURE_EXIT_CODE);
        }
    };
    for line in report.summary_lines() {
        println!("{line}");
    }
    exit_code(report.status().exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
