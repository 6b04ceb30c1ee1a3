use clap::Parser;
use egress_gateway::config::{Cli, Commands};
use egress_gateway::{Result, agent, cli, controller};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cancel = tokio_util::sync::CancellationToken::new();
    let ready = tokio_util::sync::CancellationToken::new();
    match cli.command {
        Commands::Agent(agent_args) => {
            setup_subscriber();
            let mut agent_handle =
                tokio::spawn(agent::start(agent_args, ready, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            tokio::select! {
                h = &mut agent_handle => exit("agent", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    if let Err(e) = agent_handle.await {
                        error!("agent exited with error: {e}");
                    }
                },
            };
            info!("Exiting...");
        }
        Commands::Controller(controller_args) => {
            setup_subscriber();
            let mut controller_handle = tokio::spawn(controller::start(
                controller_args,
                ready,
                cancel.child_token(),
            ));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            tokio::select! {
                h = &mut controller_handle => exit("controller", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    if let Err(e) = controller_handle.await {
                        error!("controller exited with error: {e}");
                    }
                },
            };
            info!("Exiting...");
        }
        Commands::Crdgen => egress_gateway_crds::crd_gen()?,
        Commands::Entries(entries_args) => cli::entries(entries_args).await?,
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "egress_gateway=info,egress_gateway_controller=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(%e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(%e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured terminate signal");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
