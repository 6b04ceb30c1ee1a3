pub mod agent;
pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod http;
pub mod metrics;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Controller(#[from] egress_gateway_controller::Error),

    #[error(transparent)]
    Crd(#[from] egress_gateway_crds::Error),

    #[error(transparent)]
    Common(#[from] egress_gateway_common::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    #[error("table map error: {0}")]
    TableMap(String),

    #[error("task failed: {0}")]
    Task(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Flattens the outcome of a spawned task, logging failures.
pub(crate) fn join_result(task: &str, out: Result<Result<()>, JoinError>) -> Result<()> {
    out.map_err(|e| Error::Task(format!("{task}: {e}")))?
        .inspect_err(|e| error!(%e, task, "task failed"))
}
