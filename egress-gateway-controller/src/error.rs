use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("node {node}: {reason}")]
    NodeTable { node: String, reason: String },

    #[error("json conversion error: {0}")]
    JsonConversion(#[from] serde_json::Error),

    #[error("failed to convert: {0}")]
    ConversionError(String),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::StoreCreation(_) => "store_creation",
            Error::Timeout(_) => "timeout",
            Error::NodeTable { .. } => "node_table",
            Error::JsonConversion(_) => "json_conversion",
            Error::ConversionError(_) => "conversion",
            Error::Task(_) => "task",
        }
        .into()
    }
}

/// Failure to turn one policy into table rows. Scoped to that policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("invalid selector: {0}")]
    SelectorResolutionError(String),

    #[error("gateway {index} sets both egressIP and interface")]
    ConflictingEgressIPConfig { index: usize },

    #[error("no egress IP available on node {node}: {reason}")]
    NoEgressIPAvailable { node: String, reason: String },

    #[error("no node matches any gateway selector")]
    NoMatchingGatewayNode,

    #[error("programming node {node} failed: {reason}")]
    TransientProgrammingFailure { node: String, reason: String },

    #[error("invalid CIDR {cidr}: {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("invalid gateway {index}: {reason}")]
    InvalidGatewayConfig { index: usize, reason: String },

    #[error("destinationCIDRs must not be empty")]
    MissingDestinationCidrs,

    #[error("resolution did not finish within {0:?}")]
    ResolutionTimeout(Duration),

    #[error("resolution aborted: {0}")]
    Aborted(String),
}

impl ResolutionError {
    /// Short CamelCase reason used in status conditions and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            ResolutionError::SelectorResolutionError(_) => "SelectorResolutionError",
            ResolutionError::ConflictingEgressIPConfig { .. } => "ConflictingEgressIPConfig",
            ResolutionError::NoEgressIPAvailable { .. } => "NoEgressIPAvailable",
            ResolutionError::NoMatchingGatewayNode => "NoMatchingGatewayNode",
            ResolutionError::TransientProgrammingFailure { .. } => "TransientProgrammingFailure",
            ResolutionError::InvalidCidr { .. } => "InvalidCidr",
            ResolutionError::InvalidGatewayConfig { .. } => "InvalidGatewayConfig",
            ResolutionError::MissingDestinationCidrs => "MissingDestinationCidrs",
            ResolutionError::ResolutionTimeout(_) => "ResolutionTimeout",
            ResolutionError::Aborted(_) => "Aborted",
        }
    }

    /// Problems that keep a resolved policy from being reported as Installed.
    /// A policy without gateway nodes is still installed: it routes nothing.
    pub fn blocks_install(&self) -> bool {
        matches!(
            self,
            ResolutionError::NoEgressIPAvailable { .. }
                | ResolutionError::TransientProgrammingFailure { .. }
        )
    }
}
