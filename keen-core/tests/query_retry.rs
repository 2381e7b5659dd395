//! Integration tests for queries and the failed-query cache

mod common;

use common::{harness, harness_with, Reply, PROJECT_ID, READ_KEY};
use keen_core::config::{QueryConfig, UploadConfig};
use keen_core::db::StoreLimits;
use keen_core::network::HttpMethod;
use keen_core::{AnalysisType, Error, ProxyConfig, Query};
use serde_json::{json, Map, Value};

fn obj(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn count_purchases() -> Query {
    Query::analysis(
        AnalysisType::Count,
        obj(json!({"event_collection": "purchases", "timeframe": "this_14_days"})),
    )
}

fn with_max_attempts(max_query_attempts: u32) -> common::Harness {
    harness_with(
        StoreLimits::default(),
        UploadConfig::default(),
        QueryConfig {
            max_query_attempts,
            ..QueryConfig::default()
        },
    )
}

#[tokio::test]
async fn test_count_query_request() {
    let h = harness();
    h.transport.push(Reply::Status(200, json!({"result": 42})));

    let result = h.client.run_query(&count_purchases()).await.unwrap();
    assert_eq!(result["result"], 42);

    let request = &h.transport.requests()[0];
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(
        request.url,
        format!("https://api.keen.io/3.0/projects/{}/queries/count", PROJECT_ID)
    );
    assert_eq!(request.header("Authorization"), Some(READ_KEY));
    assert_eq!(h.transport.bodies()[0]["event_collection"], "purchases");
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_saved_and_dataset_requests() {
    let h = harness();
    h.client.run_saved_analysis("weekly").await.unwrap();
    h.client
        .run_dataset_query("daily", obj(json!({"index_by": "customer"})))
        .await
        .unwrap();

    let requests = h.transport.requests();
    assert_eq!(requests[0].method, HttpMethod::Get);
    assert!(requests[0].url.ends_with("/queries/saved/weekly/result"));
    assert!(requests[0].body.is_none());
    assert!(requests[1]
        .url
        .ends_with("/datasets/daily/results?index_by=customer"));
}

#[tokio::test]
async fn test_multi_analysis_request() {
    let h = harness();
    let queries = vec![
        count_purchases(),
        Query::named_analysis(
            AnalysisType::Sum,
            "revenue",
            obj(json!({"event_collection": "purchases", "target_property": "price"})),
        ),
    ];

    h.client.run_multi_analysis(&queries).await.unwrap();

    let request = &h.transport.requests()[0];
    assert!(request.url.ends_with("/queries/multi_analysis"));
    let body = &h.transport.bodies()[0];
    assert_eq!(body["event_collection"], "purchases");
    assert_eq!(body["timeframe"], "this_14_days");
    assert_eq!(body["analyses"]["count"]["analysis_type"], "count");
    assert_eq!(body["analyses"]["revenue"]["target_property"], "price");
}

#[tokio::test]
async fn test_failure_is_recorded_and_success_clears_it() {
    let h = harness();
    h.transport.push(Reply::Status(503, json!({"message": "busy"})));

    let err = h.client.run_query(&count_purchases()).await.unwrap_err();
    assert!(matches!(err, Error::HttpStatus { status: 503, .. }));

    let records = h.store().list_queries().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].query_type, "count");
    assert_eq!(records[0].attempts, 1);

    h.client.run_query(&count_purchases()).await.unwrap();
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_query_exhausts_attempts() {
    let h = with_max_attempts(3);
    for _ in 0..3 {
        h.transport.push(Reply::Status(500, json!({})));
    }

    assert!(h.client.run_query(&count_purchases()).await.is_err());
    assert_eq!(h.store().list_queries().unwrap()[0].attempts, 1);

    let retries = h.client.retry_failed_queries().await.unwrap();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].previous_attempts, 1);
    assert!(retries[0].result.is_err());
    assert_eq!(h.store().list_queries().unwrap()[0].attempts, 2);

    // Third failure reaches the limit; the record stays as a block
    let retries = h.client.retry_failed_queries().await.unwrap();
    assert_eq!(retries.len(), 1);
    assert_eq!(h.store().list_queries().unwrap()[0].attempts, 3);

    let retries = h.client.retry_failed_queries().await.unwrap();
    assert!(retries.is_empty());
    assert_eq!(h.transport.request_count(), 3);
}

#[tokio::test]
async fn test_exhausted_query_is_not_sent_again() {
    let h = with_max_attempts(2);
    h.transport.push(Reply::Status(500, json!({})));
    h.transport.push(Reply::Status(500, json!({})));

    for _ in 0..2 {
        assert!(matches!(
            h.client.run_query(&count_purchases()).await,
            Err(Error::HttpStatus { status: 500, .. })
        ));
    }
    assert_eq!(h.transport.request_count(), 2);

    let err = h.client.run_query(&count_purchases()).await.unwrap_err();
    assert!(matches!(err, Error::QueryAbandoned { attempts: 2 }));
    assert_eq!(h.transport.request_count(), 2);
    assert_eq!(h.store().list_queries().unwrap()[0].attempts, 2);

    // Once the record expires the query may run again
    let future = chrono::Utc::now() + chrono::Duration::seconds(5);
    h.store().delete_queries_attempted_before(future).unwrap();
    h.client.run_query(&count_purchases()).await.unwrap();
    assert_eq!(h.transport.request_count(), 3);
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_retry_replays_stored_query() {
    let h = harness();
    h.transport.push(Reply::TransportError("timed out"));
    assert!(matches!(
        h.client.run_saved_analysis("weekly").await,
        Err(Error::Transport(_))
    ));

    h.transport.push(Reply::Status(200, json!({"result": [1, 2]})));
    let retries = h.client.retry_failed_queries().await.unwrap();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].query, Query::saved("weekly"));
    assert_eq!(retries[0].result.as_ref().unwrap()["result"], json!([1, 2]));

    let requests = h.transport.requests();
    assert_eq!(requests[0].url, requests[1].url);
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_exhausted_record_blocks_sending() {
    let h = with_max_attempts(2);
    let query = count_purchases();
    let properties = Value::Object(query.properties.clone());
    for _ in 0..3 {
        h.store()
            .record_query_failure("count", None, &properties, &query.key())
            .unwrap();
    }

    let err = h.client.run_query(&query).await.unwrap_err();
    assert!(matches!(err, Error::QueryAbandoned { attempts: 3 }));
    assert_eq!(h.transport.request_count(), 0);
    assert_eq!(h.store().get_query_count(), 1);
}

#[tokio::test]
async fn test_expired_records_are_not_retried() {
    let h = harness_with(
        StoreLimits::default(),
        UploadConfig::default(),
        QueryConfig {
            query_ttl_secs: 0,
            ..QueryConfig::default()
        },
    );
    h.store()
        .record_query_failure("count", None, &json!({"event_collection": "x"}), "stale")
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let retries = h.client.retry_failed_queries().await.unwrap();
    assert!(retries.is_empty());
    assert_eq!(h.transport.request_count(), 0);
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_query_without_read_key_is_not_sent() {
    let h = harness();
    let client = keen_core::KeenClient::new(
        keen_core::ProjectConfig::new(common::PROJECT_ID, Some("wk"), None),
        h.client.store().clone(),
        h.client.network().clone(),
        &UploadConfig::default(),
    )
    .unwrap();

    assert!(matches!(
        client.run_query(&count_purchases()).await,
        Err(Error::Config(_))
    ));
    assert_eq!(h.transport.request_count(), 0);
    assert_eq!(h.store().get_query_count(), 0);
}

#[tokio::test]
async fn test_unparseable_result_counts_as_failure() {
    let h = harness();
    h.transport.push(Reply::Raw(200, "not json"));

    assert!(matches!(
        h.client.run_query(&count_purchases()).await,
        Err(Error::Response(_))
    ));
    assert_eq!(h.store().get_query_count(), 1);
}

#[test]
fn test_set_proxy_rebuilds_transport() {
    let h = harness();
    h.client
        .set_proxy(Some(ProxyConfig {
            host: "proxy.local".to_string(),
            port: 8080,
        }))
        .unwrap();

    let settings = h.factory.settings.lock().unwrap().clone();
    assert_eq!(settings.len(), 2);
    assert!(settings[0].proxy.is_none());
    assert_eq!(settings[1].proxy.as_ref().unwrap().host, "proxy.local");
    assert_eq!(h.client.network().settings().proxy, settings[1].proxy);

    h.client.set_proxy(None).unwrap();
    assert!(h.client.network().settings().proxy.is_none());
}
