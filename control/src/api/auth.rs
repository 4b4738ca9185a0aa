use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

use crate::api::nodes::AppState;
use crate::error::ControlError;
use crate::services::credentials::bearer_token;
use crate::services::RoutePolicy;

/// Bearer credential from the request headers, if any.
pub fn request_token(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    bearer_token(header).map(str::to_string)
}

/// Route middleware enforcing a [`RoutePolicy`].
///
/// On success the resolved [`RequestContext`](crate::services::RequestContext)
/// is inserted into the request extensions for the handler.
pub async fn require_policy(
    State((state, policy)): State<(Arc<AppState>, RoutePolicy)>,
    path: Option<Path<HashMap<String, String>>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ControlError> {
    let params = path.map(|Path(p)| p).unwrap_or_default();
    let token = request_token(&req);
    let source = connect.map(|ConnectInfo(addr)| addr.ip());

    let ctx = state
        .gate
        .authorize(
            policy,
            token.as_deref(),
            params.get("network").map(String::as_str),
            params.get("nodeid").map(String::as_str),
            source,
        )
        .await?;

    debug!(
        "Authorized {} {} for {}{}",
        req.method(),
        req.uri().path(),
        ctx.username,
        if ctx.master { " (master)" } else { "" }
    );

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}
