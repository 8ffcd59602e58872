//! Search API integration tests.

mod common;

use common::{TestServer, ALICE_TOKEN, BOB_TOKEN};
use serde_json::Value;
use std::time::Duration;

async fn search(server: &TestServer, token: &str, query: &[(&str, &str)]) -> Value {
    let response = server
        .client()
        .get(server.media("/search"))
        .bearer_auth(token)
        .query(query)
        .send()
        .await
        .expect("Failed to search");
    assert_eq!(response.status(), 200);
    response.json().await.unwrap()
}

#[tokio::test]
async fn test_pagination_has_more() {
    let server = TestServer::start().await;
    for i in 0..25 {
        server
            .upload_ok(&format!("file{}.txt", i), "text/plain", format!("body {}", i).into_bytes())
            .await;
    }

    let first = search(&server, ALICE_TOKEN, &[("limit", "20")]).await;
    assert_eq!(first["results"].as_array().unwrap().len(), 20);
    assert_eq!(first["has_more"], true);

    let second = search(&server, ALICE_TOKEN, &[("limit", "20"), ("page", "1")]).await;
    assert_eq!(second["results"].as_array().unwrap().len(), 5);
    assert_eq!(second["has_more"], false);
}

#[tokio::test]
async fn test_text_filter_and_order() {
    let server = TestServer::start().await;
    server.upload_ok("holiday-1.txt", "text/plain", b"one".to_vec()).await;
    // Index keys have millisecond resolution
    tokio::time::sleep(Duration::from_millis(5)).await;
    server.upload_ok("work.txt", "text/plain", b"two".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newest = server
        .upload_ok("Holiday-2.txt", "text/plain", b"three".to_vec())
        .await;

    let json = search(&server, ALICE_TOKEN, &[("q", "holiday")]).await;
    let results = json["results"].as_array().unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["media_id"], newest.as_str());
    assert_eq!(json["has_more"], false);
}

#[tokio::test]
async fn test_results_scoped_to_caller() {
    let server = TestServer::start().await;
    server.upload_ok("alice.txt", "text/plain", b"a".to_vec()).await;

    let json = search(&server, BOB_TOKEN, &[]).await;
    assert!(json["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_search_requires_token() {
    let server = TestServer::start().await;

    let response = server
        .client()
        .get(server.media("/search"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
