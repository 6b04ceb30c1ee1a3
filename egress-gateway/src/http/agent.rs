use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use egress_gateway_common::{EntryKey, EntryValue, PolicyEntry, TableDiff};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::agent::Agent;
use crate::agent::table::{ApplySummary, TableMap};
use crate::http::{metrics, serve as serve_router};

pub const ENTRIES_PATH: &str = "/v1/entries";

pub async fn serve<M>(
    addr: SocketAddr,
    agent: Arc<Agent<M>>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()>
where
    M: TableMap<EntryKey, EntryValue> + Send + Sync + 'static,
{
    serve_router(addr, router(agent, ready), cancel).await
}

pub fn router<M>(agent: Arc<Agent<M>>, ready: CancellationToken) -> Router
where
    M: TableMap<EntryKey, EntryValue> + Send + Sync + 'static,
{
    Router::new()
        .route(ENTRIES_PATH, get(list::<M>).post(apply::<M>))
        .with_state(agent)
        .merge(metrics::router(ready))
}

async fn list<M>(State(agent): State<Arc<Agent<M>>>) -> Json<Vec<PolicyEntry>>
where
    M: TableMap<EntryKey, EntryValue> + Send + Sync + 'static,
{
    Json(agent.entries().await)
}

async fn apply<M>(
    State(agent): State<Arc<Agent<M>>>,
    Json(diff): Json<TableDiff>,
) -> Result<Json<ApplySummary>>
where
    M: TableMap<EntryKey, EntryValue> + Send + Sync + 'static,
{
    Ok(Json(agent.apply(&diff).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    type Map = ahash::HashMap<EntryKey, EntryValue>;

    #[tokio::test]
    async fn test_apply_then_list() {
        let agent = Arc::new(Agent::try_new(Map::default()).unwrap());
        let row = PolicyEntry {
            source_ip: "fd00:10:244::5".parse().unwrap(),
            destination_cidr: "::/0".parse().unwrap(),
            egress_ip: None,
            gateway_ip: "fd00::2".parse().unwrap(),
        };
        let Json(summary) = apply(
            State(Arc::clone(&agent)),
            Json(TableDiff {
                upserts: vec![row],
                removals: vec![],
            }),
        )
        .await
        .unwrap();
        assert_eq!(summary.written, 1);

        let Json(entries) = list(State(agent)).await;
        assert_eq!(entries, vec![row]);
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let agent = Arc::new(Agent::try_new(Map::default()).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let app = router(agent, CancellationToken::new());
        let server = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(crate::http::shutdown(cancel))
                    .await
            }
        });

        let url = format!("http://{addr}{ENTRIES_PATH}");
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "upserts": [{
                "sourceIp": "10.244.1.5",
                "destinationCidr": "10.96.0.0/12",
                "egressIp": null,
                "gatewayIp": "excluded"
            }],
            "removals": []
        });
        let response = client.post(&url).json(&body).send().await.unwrap();
        assert!(response.status().is_success());

        let entries: Vec<PolicyEntry> = client.get(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].gateway_ip.to_string(), "excluded");

        let bad = client.post(&url).body("{").header("content-type", "application/json").send().await.unwrap();
        assert!(bad.status().is_client_error());

        let ready = client.get(format!("http://{addr}/readyz")).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
