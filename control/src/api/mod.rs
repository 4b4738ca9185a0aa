pub mod auth;
pub mod nodes;
pub mod users;

use axum::{
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put, MethodRouter},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::services::{RoutePolicy, Scope};
use crate::types::HealthResponse;
use nodes::AppState;

const LIST_ALL: RoutePolicy = RoutePolicy::new(false, false, Scope::User);
const LIST_NETWORK: RoutePolicy = RoutePolicy::new(false, true, Scope::Network);
const GET_NODE: RoutePolicy = RoutePolicy::new(true, true, Scope::Node);
const UPDATE_NODE: RoutePolicy = RoutePolicy::new(false, true, Scope::Node);
const DELETE_NODE: RoutePolicy = RoutePolicy::new(true, true, Scope::Node);
const MANAGE_NODE: RoutePolicy = RoutePolicy::new(false, true, Scope::User);
const LAST_MODIFIED: RoutePolicy = RoutePolicy::new(false, true, Scope::Network);

pub fn create_router(state: Arc<AppState>) -> Router {
    let gated = |route: MethodRouter<Arc<AppState>>, policy: RoutePolicy| {
        route.route_layer(middleware::from_fn_with_state(
            (state.clone(), policy),
            auth::require_policy,
        ))
    };

    Router::new()
        // Health check
        .route("/health", get(health))
        // Node management
        .route("/api/nodes", gated(get(nodes::list_all_nodes), LIST_ALL))
        .route(
            "/api/nodes/:network",
            gated(get(nodes::list_network_nodes), LIST_NETWORK).merge(post(nodes::register_node)),
        )
        .route(
            "/api/nodes/:network/:nodeid",
            gated(get(nodes::get_node), GET_NODE)
                .merge(gated(put(nodes::update_node), UPDATE_NODE))
                .merge(gated(delete(nodes::delete_node), DELETE_NODE)),
        )
        // Topology roles
        .route(
            "/api/nodes/:network/:nodeid/createrelay",
            gated(post(nodes::create_relay), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/deleterelay",
            gated(delete(nodes::delete_relay), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/creategateway",
            gated(post(nodes::create_egress), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/deletegateway",
            gated(delete(nodes::delete_egress), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/createingress",
            gated(post(nodes::create_ingress), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/deleteingress",
            gated(delete(nodes::delete_ingress), MANAGE_NODE),
        )
        .route(
            "/api/nodes/:network/:nodeid/approve",
            gated(post(nodes::approve_node), MANAGE_NODE),
        )
        // Admin endpoints
        .route(
            "/api/nodes/adm/:network/lastmodified",
            gated(get(nodes::last_modified), LAST_MODIFIED),
        )
        .route(
            "/api/nodes/adm/:network/authenticate",
            post(nodes::authenticate_node),
        )
        .route("/api/users/adm/authenticate", post(users::authenticate_user))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Health check endpoint
async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::services::credentials::testing::{self as creds, TEST_MASTER_KEY};
    use crate::services::lifecycle::testing::{Harness, ACCESS_KEY};
    use crate::services::AuthorizationGate;

    fn app(h: &Harness) -> Router {
        let verifier = Arc::new(creds::verifier(h.signer.clone()));
        create_router(Arc::new(AppState {
            lifecycle: h.lifecycle.clone(),
            gate: AuthorizationGate::new(h.db.clone(), verifier),
        }))
    }

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn draft(name: &str) -> Value {
        json!({
            "name": name,
            "public_key": format!("pk-{}", name),
            "password": "node-password",
            "traffic_keys": { "mine": format!("traffic-{}", name) },
            "access_key": ACCESS_KEY,
        })
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::standard();
        let (status, body) = call(&app(&h), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_error_envelope_for_missing_credentials() {
        let h = Harness::standard();
        let app = app(&h);

        let (status, body) = call(&app, Method::GET, "/api/nodes", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);
        assert!(body["message"].is_string());

        // Network check runs before the credential check
        let (status, body) = call(&app, Method::GET, "/api/nodes/missing", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn test_register_then_node_scoped_access() {
        let h = Harness::standard();
        let app = app(&h);

        let (status, body) = call(&app, Method::POST, "/api/nodes/n1", None, Some(draft("a"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 200);
        assert_eq!(body["response"]["node"]["is_pending"], false);
        assert!(body["response"]["node"].get("password_hash").is_none());
        let a_id = body["response"]["node"]["id"].as_str().unwrap().to_string();

        let (_, body) = call(&app, Method::POST, "/api/nodes/n1", None, Some(draft("b"))).await;
        let b_id = body["response"]["node"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/nodes/adm/n1/authenticate",
            None,
            Some(json!({ "id": a_id, "password": "node-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let token = body["response"]["auth_token"].as_str().unwrap().to_string();

        let own = format!("/api/nodes/n1/{}", a_id);
        let (status, body) = call(&app, Method::GET, &own, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["peers"][0]["id"], b_id.as_str());

        let other = format!("/api/nodes/n1/{}", b_id);
        let (status, _) = call(&app, Method::GET, &other, Some(&token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // PUT does not accept node credentials
        let (status, _) = call(&app, Method::PUT, &own, Some(&token), Some(json!({ "mtu": 1400 }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // A node may delete itself
        let (status, _) = call(&app, Method::DELETE, &own, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_registration_failures() {
        let h = Harness::standard();
        let app = app(&h);

        let mut bad = draft("a");
        bad["access_key"] = json!("wrong");
        let (status, body) = call(&app, Method::POST, "/api/nodes/n2", None, Some(bad)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], 403);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/nodes/n1")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_master_key_and_network_admin_management() {
        let h = Harness::standard();
        let app = app(&h);
        let a = h.register("n1", "a").await;
        let b = h.register("n1", "b").await;

        let (status, body) = call(&app, Method::GET, "/api/nodes", Some(TEST_MASTER_KEY), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"].as_array().unwrap().len(), 2);

        let relay = format!("/api/nodes/n1/{}/createrelay", a.id);
        let body = json!({ "relayed_nodes": [b.id] });

        let outsider = creds::user_token(&h.signer, "bob", &["n2"], false);
        let (status, _) = call(&app, Method::POST, &relay, Some(&outsider), Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let member = creds::user_token(&h.signer, "alice", &["n1"], false);
        let (status, resp) = call(&app, Method::POST, &relay, Some(&member), Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["response"]["relay_addrs"], json!(["10.0.0.2"]));

        let gateway = format!("/api/nodes/n1/{}/creategateway", b.id);
        let (status, _) = call(
            &app,
            Method::POST,
            &gateway,
            Some(TEST_MASTER_KEY),
            Some(json!({ "ranges": ["bogus"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::GET,
            "/api/nodes/adm/n1/lastmodified",
            Some(&member),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["response"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_server_node_delete_conflict() {
        let h = Harness::standard();
        let app = app(&h);
        let server = h
            .lifecycle
            .ensure_server_node("n1", "srv")
            .await
            .unwrap()
            .unwrap();

        let uri = format!("/api/nodes/n1/{}", server.id);
        let (status, body) = call(&app, Method::DELETE, &uri, Some(TEST_MASTER_KEY), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 409);
    }
}
