use egress_gateway_common::{PolicyEntry, table};

use crate::config::EntriesArgs;

/// Prints the rows the controller last installed on a node.
pub async fn entries(args: EntriesArgs) -> anyhow::Result<()> {
    let url = format!(
        "{}/v1/nodes/{}/entries",
        args.controller.trim_end_matches('/'),
        args.node
    );
    let response = reqwest::get(&url).await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("no egress table installed on node {}", args.node);
    }
    let entries: Vec<PolicyEntry> = response.error_for_status()?.json().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{}", table::render(&entries));
    }
    Ok(())
}
