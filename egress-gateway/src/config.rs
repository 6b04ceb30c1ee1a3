use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use egress_gateway_common::DEFAULT_AGENT_PORT;
use ipnetwork::IpNetwork;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Resolve egress gateway policies and program every node
    Controller(ControllerArgs),

    /// Own the egress table of the local node
    Agent(AgentArgs),

    /// Print the EgressGatewayPolicy CRD
    Crdgen,

    /// Show the egress table installed on a node
    Entries(EntriesArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Metrics and diagnostic API listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Port the node agents listen on
    #[arg(long, env = "AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    pub agent_port: u16,

    /// Service and API server ranges that never leave through a gateway
    #[arg(long, env = "INTERNAL_CIDRS", value_delimiter = ',')]
    pub internal_cidrs: Vec<IpNetwork>,

    /// Timeout for a single node table update
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub push_timeout: Duration,

    /// Timeout for resolving a single policy
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub resolve_timeout: Duration,

    /// Attempts per node table update before the node is marked failed
    #[arg(long, default_value_t = 3)]
    pub retry_attempts: u32,

    /// Full recompute interval when nothing changes
    #[arg(long, default_value = "300s", value_parser = humantime::parse_duration)]
    pub resync_interval: Duration,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Table API and metrics listener
    #[arg(long, default_value = "0.0.0.0:9965")]
    pub listen_address: SocketAddr,

    /// How often interface addresses are republished to the node
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub annotation_refresh: Duration,

    /// Directory holding the kernel route tables
    #[arg(long, default_value = "/proc/net")]
    pub proc_net: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct EntriesArgs {
    /// Node to show
    #[arg(long)]
    pub node: String,

    /// Controller API base URL
    #[arg(
        long,
        env = "EGRESS_GATEWAY_CONTROLLER",
        default_value = "http://127.0.0.1:9090"
    )]
    pub controller: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
