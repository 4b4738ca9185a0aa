use crate::common::{node_id, TestControl, MASTER_KEY};
use reqwest::Method;
use serde_json::json;

#[tokio::test]
async fn test_relay_shapes_peer_lists() {
    let control = TestControl::new().await;
    let relay = control.register("n1", "relay").await;
    let member = control.register("n1", "member").await;
    let other = control.register("n1", "other").await;

    let (status, body) = control
        .call(
            Method::POST,
            &format!("/api/nodes/n1/{}/createrelay", node_id(&relay)),
            Some(MASTER_KEY),
            Some(json!({ "relayed_nodes": [node_id(&member)] })),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["response"]["is_relay"], true);
    assert_eq!(body["response"]["relay_addrs"], json!(["10.20.0.2"]));

    // The relayed node only talks to its relay
    let (_, got) = control
        .call(
            Method::GET,
            &format!("/api/nodes/n1/{}", node_id(&member)),
            Some(MASTER_KEY),
            None,
        )
        .await;
    let peers = got["response"]["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], relay["node"]["id"]);

    // Everyone else reaches the member through the relay's allowed IPs
    let (_, got) = control
        .call(
            Method::GET,
            &format!("/api/nodes/n1/{}", node_id(&other)),
            Some(MASTER_KEY),
            None,
        )
        .await;
    let peers = got["response"]["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    let allowed = peers[0]["allowed_ips"].as_array().unwrap();
    assert!(allowed.contains(&json!("10.20.0.2/32")));

    // Nested relays are refused
    let (status, _) = control
        .call(
            Method::POST,
            &format!("/api/nodes/n1/{}/createrelay", node_id(&other)),
            Some(MASTER_KEY),
            Some(json!({ "relayed_nodes": [node_id(&relay)] })),
        )
        .await;
    assert_eq!(status, 400);

    // Deleting the member repairs the relay's address list
    let (status, _) = control
        .call(
            Method::DELETE,
            &format!("/api/nodes/n1/{}", node_id(&member)),
            Some(MASTER_KEY),
            None,
        )
        .await;
    assert_eq!(status, 200);

    let (_, got) = control
        .call(
            Method::GET,
            &format!("/api/nodes/n1/{}", node_id(&relay)),
            Some(MASTER_KEY),
            None,
        )
        .await;
    assert_eq!(got["response"]["node"]["relay_addrs"], json!([]));
    assert_eq!(got["response"]["node"]["is_relay"], false);
}

#[tokio::test]
async fn test_gateway_roles() {
    let control = TestControl::new().await;
    let gw = control.register("n1", "gw").await;
    let path = format!("/api/nodes/n1/{}", node_id(&gw));

    let (status, body) = control
        .call(
            Method::POST,
            &format!("{}/creategateway", path),
            Some(MASTER_KEY),
            Some(json!({ "ranges": ["192.168.10.0/24"], "interface": "eth0" })),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["response"]["is_egress"], true);
    assert_eq!(body["response"]["egress_ranges"], json!(["192.168.10.0/24"]));

    let (status, _) = control
        .call(
            Method::POST,
            &format!("{}/creategateway", path),
            Some(MASTER_KEY),
            Some(json!({ "ranges": [] })),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = control
        .call(Method::POST, &format!("{}/createingress", path), Some(MASTER_KEY), None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["response"]["is_ingress"], true);

    let (status, body) = control
        .call(Method::DELETE, &format!("{}/deletegateway", path), Some(MASTER_KEY), None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["response"]["is_egress"], false);
    assert_eq!(body["response"]["egress_ranges"], json!([]));

    let (status, body) = control
        .call(Method::DELETE, &format!("{}/deleteingress", path), Some(MASTER_KEY), None)
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["response"]["is_ingress"], false);
}
