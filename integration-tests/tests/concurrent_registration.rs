use crate::common::{node_draft, TestControl};
use std::collections::HashSet;

#[tokio::test]
async fn test_concurrent_registration_gets_unique_addresses() {
    let control = TestControl::new().await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let url = control.url("/api/nodes/n1");
        let client = control.http.clone();
        handles.push(tokio::spawn(async move {
            let resp = client
                .post(&url)
                .json(&node_draft(&format!("node-{}", i)))
                .send()
                .await
                .expect("Failed to register");
            assert_eq!(resp.status(), 200);
            resp.json::<serde_json::Value>()
                .await
                .expect("Failed to parse response")
        }));
    }

    let results: Vec<serde_json::Value> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked"))
        .collect();

    let ids: HashSet<&str> = results
        .iter()
        .map(|r| r["response"]["node"]["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 10, "Expected 10 unique node IDs");

    let addrs: HashSet<&str> = results
        .iter()
        .map(|r| r["response"]["node"]["address"].as_str().unwrap())
        .collect();
    assert_eq!(addrs.len(), 10, "Expected 10 unique addresses");
}

#[tokio::test]
async fn test_single_use_key_admits_one_registration() {
    let control = TestControl::new().await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let url = control.url("/api/nodes/scarce");
        let client = control.http.clone();
        handles.push(tokio::spawn(async move {
            client
                .post(&url)
                .json(&node_draft(&format!("node-{}", i)))
                .send()
                .await
                .expect("Failed to register")
                .status()
        }));
    }

    let statuses: Vec<u16> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("Task panicked").as_u16())
        .collect();

    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == 403).count(), 3);
}
