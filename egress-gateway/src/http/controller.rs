use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use egress_gateway_common::table;
use egress_gateway_controller::{NodeTables, Reconciler};
use http::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::http::{metrics, serve as serve_router};

#[derive(Debug, Default, Deserialize)]
struct EntriesQuery {
    format: Option<String>,
}

pub async fn serve<T: NodeTables>(
    addr: SocketAddr,
    reconciler: Arc<Reconciler<T>>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    serve_router(addr, router(reconciler, ready), cancel).await
}

pub fn router<T: NodeTables>(reconciler: Arc<Reconciler<T>>, ready: CancellationToken) -> Router {
    Router::new()
        .route("/v1/nodes/{node}/entries", get(entries::<T>))
        .with_state(reconciler)
        .merge(metrics::router(ready))
}

/// Rows last installed on a node. `?format=table` renders them for humans.
async fn entries<T: NodeTables>(
    State(reconciler): State<Arc<Reconciler<T>>>,
    Path(node): Path<String>,
    Query(query): Query<EntriesQuery>,
) -> Response {
    let Some(entries) = reconciler.installed_entries(&node).await else {
        return (StatusCode::NOT_FOUND, format!("no table installed on node {node}\n")).into_response();
    };
    match query.format.as_deref() {
        Some("table") => table::render(&entries).into_response(),
        _ => Json(entries).into_response(),
    }
}
