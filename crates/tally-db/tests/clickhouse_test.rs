//! ClickHouse adapter against a mocked HTTP interface.

use chrono::{TimeZone, Utc};
use tally_core::{AnalyticsStore, Error, RawEvent};
use tally_db::{ClickHouseConfig, ClickHouseStore};
use wiremock::matchers::{header, method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer) -> ClickHouseStore {
    let config = ClickHouseConfig::default()
        .with_url(server.uri())
        .with_database("analytics")
        .with_credentials("ingest", "secret");
    ClickHouseStore::new(config).unwrap()
}

fn event(user: &str, action: &str, duration: f64) -> RawEvent {
    RawEvent {
        id: None,
        user_id: user.to_string(),
        action: action.to_string(),
        element: "btn".to_string(),
        duration,
        timestamp: Utc.with_ymd_and_hms(2026, 4, 1, 8, 30, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_insert_sends_json_each_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(query_param(
            "query",
            "INSERT INTO analytics.events FORMAT JSONEachRow",
        ))
        .and(header("X-ClickHouse-User", "ingest"))
        .and(header("X-ClickHouse-Key", "secret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_for(&server);
    store
        .commit_raw_events(&[event("u1", "click", 1.5), event("u2", "view", 0.0)])
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let lines: Vec<serde_json::Value> = body
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["user_id"], "u1");
    assert_eq!(lines[0]["duration"], 1.5);
    assert_eq!(lines[0]["timestamp"], "2026-04-01 08:30:00");
    assert_eq!(lines[1]["action"], "view");
}

#[tokio::test]
async fn test_empty_insert_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    store_for(&server).commit_raw_events(&[]).await.unwrap();
}

#[tokio::test]
async fn test_server_error_maps_to_analytical_store_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Code: 60. Table does not exist"))
        .mount(&server)
        .await;

    let err = store_for(&server)
        .commit_raw_events(&[event("u1", "click", 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AnalyticalStore(ref msg) if msg.contains("HTTP 500")));
    assert!(!err.is_durability_critical());
}

#[tokio::test]
async fn test_unreachable_server_is_analytical_store_error() {
    let config = ClickHouseConfig::default().with_url("http://127.0.0.1:1");
    let store = ClickHouseStore::new(config).unwrap();
    let err = store
        .commit_raw_events(&[event("u1", "click", 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AnalyticalStore(_)));
}

#[tokio::test]
async fn test_summarize_parses_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(query_param("output_format_json_quote_64bit_integers", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"action\":\"click\",\"count\":12,\"avg_duration\":1.25}\n\
             {\"action\":\"view\",\"count\":3,\"avg_duration\":0}\n",
        ))
        .mount(&server)
        .await;

    let summary = store_for(&server).summarize().await.unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[0].action, "click");
    assert_eq!(summary[0].count, 12);
    assert_eq!(summary[0].avg_duration, 1.25);
    assert_eq!(summary[1].count, 3);
}

#[tokio::test]
async fn test_ensure_schema_issues_create_table() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    store_for(&server).ensure_schema().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let query = requests[0]
        .url
        .query_pairs()
        .find(|(k, _)| k == "query")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert!(query.starts_with("CREATE TABLE IF NOT EXISTS analytics.events"));
    assert!(query.contains("ENGINE = MergeTree()"));
    assert!(query.contains("TTL timestamp + INTERVAL 1 MONTH"));
}
