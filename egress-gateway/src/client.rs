use std::net::SocketAddr;

use egress_gateway_common::{PolicyEntry, TableDiff};
use egress_gateway_controller::snapshot::GatewayNode;
use egress_gateway_controller::{Error as ControllerError, NodeTables, Result as ControllerResult};
use tracing::{debug, instrument};

use crate::Result;
use crate::http::agent::ENTRIES_PATH;

/// Programs node tables through the agent API on each node.
#[derive(Clone, Debug)]
pub struct AgentClient {
    http: reqwest::Client,
    port: u16,
}

impl AgentClient {
    pub fn try_new(port: u16) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, port })
    }

    fn url(&self, node: &GatewayNode) -> ControllerResult<String> {
        let ip = node.internal_ips.first().ok_or_else(|| ControllerError::NodeTable {
            node: node.name.clone(),
            reason: "node has no internal IP".into(),
        })?;
        Ok(format!(
            "http://{}{ENTRIES_PATH}",
            SocketAddr::new(*ip, self.port)
        ))
    }

    async fn check(node: &GatewayNode, response: reqwest::Response) -> ControllerResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControllerError::NodeTable {
            node: node.name.clone(),
            reason: format!("agent returned {status}: {body}"),
        })
    }
}

fn transport_error(node: &GatewayNode, e: reqwest::Error) -> ControllerError {
    ControllerError::NodeTable {
        node: node.name.clone(),
        reason: e.to_string(),
    }
}

impl NodeTables for AgentClient {
    #[instrument(skip_all, fields(node = %node.name))]
    async fn apply(&self, node: &GatewayNode, diff: &TableDiff) -> ControllerResult<()> {
        let url = self.url(node)?;
        let response = self
            .http
            .post(url)
            .json(diff)
            .send()
            .await
            .map_err(|e| transport_error(node, e))?;
        Self::check(node, response).await?;
        debug!(
            upserts = diff.upserts.len(),
            removals = diff.removals.len(),
            "agent accepted diff"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(node = %node.name))]
    async fn list(&self, node: &GatewayNode) -> ControllerResult<Vec<PolicyEntry>> {
        let url = self.url(node)?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(node, e))?;
        Self::check(node, response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(node, e))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use egress_gateway_common::{EntryKey, EntryValue};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::agent::Agent;

    fn node(name: &str, ips: &[&str]) -> GatewayNode {
        GatewayNode {
            name: name.into(),
            internal_ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_url() {
        let client = AgentClient::try_new(9965).unwrap();
        assert_eq!(
            client.url(&node("node1", &["10.0.0.1"])).unwrap(),
            "http://10.0.0.1:9965/v1/entries"
        );
        assert_eq!(
            client.url(&node("node1", &["fd00::1", "10.0.0.1"])).unwrap(),
            "http://[fd00::1]:9965/v1/entries"
        );
        assert!(matches!(
            client.url(&node("node1", &[])),
            Err(ControllerError::NodeTable { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_and_list_against_agent() {
        let agent = Arc::new(Agent::try_new(ahash::HashMap::<EntryKey, EntryValue>::default()).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let app = crate::http::agent::router(agent, CancellationToken::new());
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(crate::http::shutdown(cancel))
                    .await
            }
        });

        let client = AgentClient::try_new(port).unwrap();
        let target = node("node1", &["127.0.0.1"]);
        let row = PolicyEntry {
            source_ip: "10.244.1.5".parse().unwrap(),
            destination_cidr: "0.0.0.0/0".parse().unwrap(),
            egress_ip: None,
            gateway_ip: "10.0.0.2".parse().unwrap(),
        };
        let diff = TableDiff {
            upserts: vec![row],
            removals: vec![],
        };
        client.apply(&target, &diff).await.unwrap();
        client.apply(&target, &diff).await.unwrap();
        assert_eq!(client.list(&target).await.unwrap(), vec![row]);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = AgentClient::try_new(port).unwrap();
        let err = client.list(&node("node1", &["127.0.0.1"])).await.unwrap_err();
        assert!(matches!(err, ControllerError::NodeTable { node, .. } if node == "node1"));
    }
}
