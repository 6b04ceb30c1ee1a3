use std::sync::Arc;

use egress_gateway_controller::{
    ControllerSettings, Reconciler, ReconcilerConfig, RetryPolicy, start_egress_controller,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::AgentClient;
use crate::config::ControllerArgs;
use crate::{Error, Result, http, join_result};

pub async fn start(
    args: ControllerArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = kube::Client::try_default().await?;
    let agents = AgentClient::try_new(args.agent_port)?;
    let reconciler = Arc::new(Reconciler::new(
        agents,
        ReconcilerConfig {
            resolve_timeout: args.resolve_timeout,
            push_timeout: args.push_timeout,
            retry: RetryPolicy {
                attempts: args.retry_attempts.max(1),
                ..Default::default()
            },
        },
    ));
    let settings = ControllerSettings {
        internal_cidrs: args.internal_cidrs,
        resync_interval: args.resync_interval,
        ..Default::default()
    };
    info!(
        agent_port = args.agent_port,
        internal_cidrs = settings.internal_cidrs.len(),
        "starting egress gateway controller"
    );

    let mut api = tokio::spawn(http::controller::serve(
        args.metrics_address,
        Arc::clone(&reconciler),
        ready.clone(),
        cancel.child_token(),
    ));
    let mut controller = tokio::spawn(start_egress_controller(
        client,
        reconciler,
        settings,
        ready,
        cancel.child_token(),
    ));

    tokio::select! {
        h = &mut api => {
            cancel.cancel();
            let _ = controller.await;
            join_result("api", h)
        }
        h = &mut controller => {
            cancel.cancel();
            let _ = api.await;
            join_result("controller", h.map(|r| r.map_err(Error::from)))
        }
    }
}
