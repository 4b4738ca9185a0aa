use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    Extension, Json,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::info;

use crate::{
    error::{ControlError, ControlResult, SuccessResponse},
    services::{credentials::bearer_token, AuthorizationGate, NodeLifecycle, RequestContext},
    types::{
        AuthParams, EgressGatewayRequest, LoginResponse, Node, NodeDraft, NodeGet, NodePatch,
        RelayRequest,
    },
};

pub struct AppState {
    pub lifecycle: Arc<NodeLifecycle>,
    pub gate: AuthorizationGate,
}

type Reply<T> = ControlResult<Json<SuccessResponse<T>>>;

/// Decode a JSON body, reporting failures in the standard error shape.
pub fn json_body<T: DeserializeOwned>(body: &Bytes) -> ControlResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ControlError::InvalidInput(format!("malformed request body: {}", e)))
}

fn require_manager(ctx: &RequestContext, network: &str) -> ControlResult<()> {
    if ctx.can_manage(network) {
        Ok(())
    } else {
        Err(ControlError::Unauthorized(format!(
            "user {} cannot manage network {}",
            ctx.username, network
        )))
    }
}

/// GET /api/nodes - Every node visible to the caller
pub async fn list_all_nodes(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> Reply<Vec<Node>> {
    let nodes = state.lifecycle.list_all(&ctx).await?;
    Ok(SuccessResponse::ok("retrieved nodes", nodes))
}

/// GET /api/nodes/:network - Nodes of one network, pending included
pub async fn list_network_nodes(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
) -> Reply<Vec<Node>> {
    let nodes = state.lifecycle.list_network(&network).await?;
    Ok(SuccessResponse::ok(
        format!("retrieved nodes of network {}", network),
        nodes,
    ))
}

/// GET /api/nodes/:network/:nodeid - Node with its peers and server metadata
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<NodeGet> {
    let got = state.lifecycle.get(&network, &node_id).await?;
    Ok(SuccessResponse::ok("retrieved node", got))
}

/// POST /api/nodes/:network - Register a node (access-key gated)
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply<NodeGet> {
    let draft: NodeDraft = json_body(&body)?;
    let bearer = bearer_token(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()))
        .map(str::to_string);

    let got = state.lifecycle.register(&network, bearer, draft).await?;
    let message = if got.node.is_pending {
        "node registered, awaiting approval"
    } else {
        "node registered"
    };
    Ok(SuccessResponse::ok(message, got))
}

/// PUT /api/nodes/:network/:nodeid - Patch a node
pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
    body: Bytes,
) -> Reply<Node> {
    let patch: NodePatch = json_body(&body)?;
    info!("{} updating node {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.update(&network, &node_id, patch).await?;
    Ok(SuccessResponse::ok("node updated", node))
}

/// DELETE /api/nodes/:network/:nodeid
pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    info!("{} deleting node {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.delete(&network, &node_id).await?;
    Ok(SuccessResponse::ok("node deleted", node))
}

/// POST /api/nodes/:network/:nodeid/approve
pub async fn approve_node(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    info!("{} approving node {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.approve(&network, &node_id).await?;
    Ok(SuccessResponse::ok("node approved", node))
}

/// POST /api/nodes/:network/:nodeid/createrelay
pub async fn create_relay(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
    body: Bytes,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    let req: RelayRequest = json_body(&body)?;
    info!(
        "{} making {} a relay for {:?} in {}",
        ctx.username, node_id, req.relayed_nodes, network
    );
    let node = state
        .lifecycle
        .create_relay(&network, &node_id, req.relayed_nodes)
        .await?;
    Ok(SuccessResponse::ok("relay created", node))
}

/// DELETE /api/nodes/:network/:nodeid/deleterelay
pub async fn delete_relay(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    info!("{} removing relay {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.delete_relay(&network, &node_id).await?;
    Ok(SuccessResponse::ok("relay deleted", node))
}

/// POST /api/nodes/:network/:nodeid/creategateway
pub async fn create_egress(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
    body: Bytes,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    let req: EgressGatewayRequest = json_body(&body)?;
    info!(
        "{} making {} an egress gateway for {:?} in {}",
        ctx.username, node_id, req.ranges, network
    );
    let node = state.lifecycle.create_egress(&network, &node_id, req).await?;
    Ok(SuccessResponse::ok("egress gateway created", node))
}

/// DELETE /api/nodes/:network/:nodeid/deletegateway
pub async fn delete_egress(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    info!("{} removing egress gateway {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.delete_egress(&network, &node_id).await?;
    Ok(SuccessResponse::ok("egress gateway deleted", node))
}

/// POST /api/nodes/:network/:nodeid/createingress
pub async fn create_ingress(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    info!("{} making {} an ingress gateway in {}", ctx.username, node_id, network);
    let node = state.lifecycle.create_ingress(&network, &node_id).await?;
    Ok(SuccessResponse::ok("ingress gateway created", node))
}

/// DELETE /api/nodes/:network/:nodeid/deleteingress
pub async fn delete_ingress(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Path((network, node_id)): Path<(String, String)>,
) -> Reply<Node> {
    require_manager(&ctx, &network)?;
    info!("{} removing ingress gateway {} in {}", ctx.username, node_id, network);
    let node = state.lifecycle.delete_ingress(&network, &node_id).await?;
    Ok(SuccessResponse::ok("ingress gateway deleted", node))
}

/// GET /api/nodes/adm/:network/lastmodified
pub async fn last_modified(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
) -> Reply<i64> {
    let stamp = state.lifecycle.last_modified(&network).await?;
    Ok(SuccessResponse::ok("retrieved last modified", stamp))
}

/// POST /api/nodes/adm/:network/authenticate - Node bootstrap login
pub async fn authenticate_node(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
    body: Bytes,
) -> Reply<LoginResponse> {
    let params: AuthParams = json_body(&body)?;
    let login = state.lifecycle.authenticate_node(&network, params).await?;
    Ok(SuccessResponse::ok("node authenticated", login))
}
