use async_trait::async_trait;
use erp_gateway::protocol::{
    AuthGrant, MockTransport, RpcTransport, TransportError, TransportResult,
};
use erp_gateway::{
    BatchOperation, BatchRequest, ChunkStatus, EnvSource, ErrorKind, ExportFormat, ExportRequest,
    Gateway, GatewayConfig, GatewayError, InstanceConfig, JobStatus, Outcome, RemoteCall, RpcArgs,
    SearchQuery,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CONFIG: &str = r#"
default_instance = "a"

[retry]
max_attempts = 4
initial_delay_ms = 10
max_delay_ms = 100
backoff = "exponential"
jitter_factor = 0.0

[batch]
chunk_size = 100
workers = 4
chunk_max_attempts = 3
chunk_initial_delay_ms = 10

[instances.a]
url = "https://a.example.com/"
db = "a_db"
username = "admin"
password = "secret"
cache_ttl = 60

[instances.b]
url = "b.example.com"
db = "b_db"
username = "admin"
password = "secret"
cache_enabled = false
"#;

fn gateway(mock: &MockTransport) -> Gateway {
    gateway_with_env(mock, EnvSource::Disabled)
}

fn gateway_with_env(mock: &MockTransport, env: EnvSource) -> Gateway {
    let config = GatewayConfig::from_toml_str(CONFIG).unwrap();
    Gateway::with_env(config, Arc::new(mock.clone()), env).unwrap()
}

fn partner_query() -> SearchQuery {
    SearchQuery::new(json!([["is_company", "=", true]])).fields(["name"])
}

fn reset() -> TransportError {
    TransportError::Connect("connection reset by peer".to_string())
}

#[tokio::test(start_paused = true)]
async fn test_cached_read_misses_after_ttl() {
    let mock = MockTransport::new();
    mock.on("res.partner", "search_read", |_| Ok(json!([{"id": 1}])));
    let gw = gateway(&mock);

    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    assert_eq!(mock.count_calls("res.partner", "search_read"), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    assert_eq!(mock.count_calls("res.partner", "search_read"), 2);

    let stats = gw.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_ttl_override() {
    let mock = MockTransport::new();
    mock.on("res.partner", "search_count", |_| Ok(json!(5)));
    let gw = gateway(&mock);
    let call = RemoteCall::new("res.partner", "search_count", RpcArgs::new().arg(json!([])));

    gw.read(None, call.clone(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;
    gw.read(None, call, None).await.unwrap();

    assert_eq!(mock.count_calls("res.partner", "search_count"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_write_invalidates_model_entries() {
    let mock = MockTransport::new();
    mock.on_any(|_| Ok(json!([])));
    let gw = gateway(&mock);

    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    gw.read_records(None, "res.partner", vec![1, 2], vec!["name".to_string()])
        .await
        .unwrap();
    gw.search_read(None, "sale.order", SearchQuery::default())
        .await
        .unwrap();
    assert_eq!(gw.cache().len(), 3);

    let mut values = Map::new();
    values.insert("name".to_string(), json!("Renamed"));
    gw.update(None, "res.partner", vec![1], values).await.unwrap();
    assert_eq!(gw.cache().len(), 1);

    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    assert_eq!(mock.count_calls("res.partner", "search_read"), 2);
    gw.search_read(None, "sale.order", SearchQuery::default())
        .await
        .unwrap();
    assert_eq!(mock.count_calls("sale.order", "search_read"), 1);
}

/// Endpoint whose reads answer with the record version seen when the read
/// started, after a delay; writes bump the version immediately
struct VersionedTransport {
    sessions: MockTransport,
    version: AtomicU64,
    read_delay: Duration,
}

#[async_trait]
impl RpcTransport for VersionedTransport {
    async fn authenticate(&self, config: &InstanceConfig) -> TransportResult<AuthGrant> {
        self.sessions.authenticate(config).await
    }

    async fn validate(&self, config: &InstanceConfig, grant: &AuthGrant) -> TransportResult<()> {
        self.sessions.validate(config, grant).await
    }

    async fn execute(
        &self,
        _config: &InstanceConfig,
        _grant: &AuthGrant,
        call: &RemoteCall,
    ) -> TransportResult<Value> {
        if call.method == "write" {
            return Ok(json!(self.version.fetch_add(1, Ordering::SeqCst) + 1));
        }
        let seen = self.version.load(Ordering::SeqCst);
        tokio::time::sleep(self.read_delay).await;
        Ok(json!(seen))
    }
}

#[tokio::test(start_paused = true)]
async fn test_read_overlapping_write_is_not_cached() {
    let transport = Arc::new(VersionedTransport {
        sessions: MockTransport::new(),
        version: AtomicU64::new(0),
        read_delay: Duration::from_secs(1),
    });
    let config = GatewayConfig::from_toml_str(CONFIG).unwrap();
    let gw = Gateway::with_env(config, transport, EnvSource::Disabled).unwrap();
    gw.resolve_instance(None).await.unwrap();

    let count = || RemoteCall::new("res.partner", "search_count", RpcArgs::new().arg(json!([])));

    let reader = {
        let gw = gw.clone();
        let call = count();
        tokio::spawn(async move { gw.read(None, call, None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    gw.update(None, "res.partner", vec![1], Map::new())
        .await
        .unwrap();

    // the in-flight read started before the write and still sees version 0
    assert_eq!(reader.await.unwrap().unwrap(), json!(0));
    assert!(gw.cache().is_empty());

    assert_eq!(gw.read(None, count(), None).await.unwrap(), json!(1));
    assert_eq!(gw.cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let mock = MockTransport::new();
    mock.push_result("res.partner", "search_count", Err(reset()));
    mock.push_result(
        "res.partner",
        "search_count",
        Err(TransportError::Http {
            status: 503,
            message: "Service Unavailable".to_string(),
        }),
    );
    mock.push_result("res.partner", "search_count", Ok(json!(12)));
    let gw = gateway(&mock);

    let count = gw.search_count(None, "res.partner", json!([])).await.unwrap();

    assert_eq!(count, 12);
    assert_eq!(mock.count_calls("res.partner", "search_count"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_single_attempt() {
    let mock = MockTransport::new();
    mock.on("res.partner", "create", |_| {
        Err(TransportError::Http {
            status: 400,
            message: "Bad Request".to_string(),
        })
    });
    let gw = gateway(&mock);

    let started = tokio::time::Instant::now();
    let err = gw
        .create(None, "res.partner", json!({"name": "X"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(mock.count_calls("res.partner", "create"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_reauthenticates_once() {
    let mock = MockTransport::new();
    mock.on("res.partner", "search_read", |_| Ok(json!([])));
    let gw = gateway(&mock);

    gw.resolve_instance(None).await.unwrap();
    assert_eq!(mock.auth_count(), 1);

    mock.expire_sessions();
    gw.search_read(None, "res.partner", partner_query()).await.unwrap();

    assert_eq!(mock.auth_count(), 2);
    assert_eq!(mock.count_calls("res.partner", "search_read"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_surface_authentication_error() {
    let mock = MockTransport::new();
    mock.reject_next_logins(2);
    let gw = gateway(&mock);

    let err = gw.resolve_instance(None).await.unwrap_err();

    assert!(matches!(err, GatewayError::Authentication { .. }));
    assert!(err.is_fatal());
    assert_eq!(mock.auth_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_instance_is_configuration_error() {
    let mock = MockTransport::new();
    let gw = gateway(&mock);

    let err = gw.resolve_instance(Some("nowhere")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(mock.auth_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_with_one_failing_chunk_is_partial() {
    let mock = MockTransport::new();
    mock.on("res.partner", "write", |call| {
        let ids = call.args.args[0].as_array().cloned().unwrap_or_default();
        if ids.contains(&json!(550)) {
            Err(TransportError::Malformed("constraint violated".to_string()))
        } else {
            Ok(json!(true))
        }
    });
    mock.on("res.partner", "search_read", |_| Ok(json!([])));
    let gw = gateway(&mock);

    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    assert_eq!(gw.cache().len(), 1);

    let items: Vec<Value> = (0..1000).map(|id| json!(id)).collect();
    let mut values = Map::new();
    values.insert("active".to_string(), json!(false));
    let job = gw
        .run_batch(
            None,
            items,
            BatchOperation::Write {
                model: "res.partner".to_string(),
                values,
            },
            BatchRequest::default().chunk_size(100).workers(4),
            None,
        )
        .await
        .unwrap();

    assert_eq!(job.total_chunks, 10);
    assert_eq!(job.status, JobStatus::Partial);
    assert_eq!(job.succeeded, 900);
    assert_eq!(mock.count_calls("res.partner", "write"), 10);

    let failed_items: Vec<Value> = job.partial_errors.iter().map(|f| f.item.clone()).collect();
    let expected: Vec<Value> = (500..600).map(|id| json!(id)).collect();
    assert_eq!(failed_items, expected);

    // Write-type batches invalidate the model
    assert!(gw.cache().is_empty());

    let outcome = Outcome::from_batch(job);
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_retry_after_call_budget_exhausted() {
    let mock = MockTransport::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    mock.on("res.partner", "unlink", move |_| {
        // The first four calls use up the call-level budget
        if counter.fetch_add(1, Ordering::SeqCst) < 4 {
            Err(TransportError::Timeout(Duration::from_secs(30)))
        } else {
            Ok(json!(true))
        }
    });
    let gw = gateway(&mock);

    let job = gw
        .run_batch(
            None,
            vec![json!(1), json!(2), json!(3)],
            BatchOperation::Unlink {
                model: "res.partner".to_string(),
            },
            BatchRequest::default(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.chunks[0].status, ChunkStatus::Retried { retries: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_runs_nothing() {
    let mock = MockTransport::new();
    let gw = gateway(&mock);
    let token = CancellationToken::new();
    token.cancel();

    let job = gw
        .run_batch(
            None,
            (0..250).map(|id| json!(id)).collect(),
            BatchOperation::Unlink {
                model: "res.partner".to_string(),
            },
            BatchRequest::default().cancel(token),
            None,
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.total_chunks, 3);
    assert_eq!(job.partial_errors.len(), 250);
    assert_eq!(mock.count_calls("res.partner", "unlink"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_paged_read_keeps_order() {
    let mock = MockTransport::new().with_call_latency(Duration::from_millis(5));
    mock.on("res.partner", "search_count", |_| Ok(json!(25)));
    mock.on("res.partner", "search_read", |call| {
        let offset = call.args.kwargs["offset"].as_u64().unwrap_or(0);
        let limit = call.args.kwargs["limit"].as_u64().unwrap_or(0);
        let records: Vec<Value> = (offset..(offset + limit).min(25))
            .map(|id| json!({ "id": id }))
            .collect();
        Ok(Value::Array(records))
    });
    let gw = gateway(&mock);

    let paged = gw
        .paged_search_read(
            None,
            "res.partner",
            SearchQuery::default().fields(["id"]),
            10,
            BatchRequest::default().workers(3),
        )
        .await
        .unwrap();

    assert_eq!(paged.total, 25);
    assert_eq!(paged.job.total_chunks, 3);
    let ids: Vec<u64> = paged
        .records
        .iter()
        .filter_map(|r| r["id"].as_u64())
        .collect();
    assert_eq!(ids, (0..25).collect::<Vec<_>>());
}

fn partner_pages(mock: &MockTransport, count: u64) {
    mock.on("res.partner", "search_count", move |_| Ok(json!(count)));
    mock.on("res.partner", "search_read", move |call| {
        let offset = call.args.kwargs["offset"].as_u64().unwrap_or(0);
        let limit = call.args.kwargs["limit"].as_u64().unwrap_or(0);
        let records: Vec<Value> = (offset..(offset + limit).min(count))
            .map(|id| {
                let parent = if id % 2 == 0 { json!([1, "Root"]) } else { json!(false) };
                json!({ "id": id, "name": format!("P{}", id), "parent_id": parent })
            })
            .collect();
        Ok(Value::Array(records))
    });
}

#[tokio::test(start_paused = true)]
async fn test_csv_export_streams_capped_pages() {
    let mock = MockTransport::new();
    partner_pages(&mock, 25);
    mock.on("res.partner", "fields_get", |_| {
        Ok(json!({ "name": { "string": "Partner Name" } }))
    });
    let gw = gateway(&mock);

    let mut out = Vec::new();
    let summary = gw
        .export(
            None,
            "res.partner",
            SearchQuery::default().fields(["name", "parent_id"]),
            ExportRequest::default().page_size(5).max_records(12),
            &mut out,
        )
        .await
        .unwrap();

    assert_eq!(summary.total, 12);
    assert_eq!(summary.exported, 12);
    assert_eq!(summary.job.total_chunks, 3);
    assert_eq!(summary.job.status, JobStatus::Succeeded);

    let limits: Vec<u64> = mock
        .calls()
        .iter()
        .filter(|(_, call)| call.method == "search_read")
        .filter_map(|(_, call)| call.args.kwargs["limit"].as_u64())
        .collect();
    let mut limits_sorted = limits.clone();
    limits_sorted.sort_unstable();
    assert_eq!(limits_sorted, vec![2, 5, 5]);

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 13);
    assert_eq!(lines[0], "Partner Name,parent_id");
    assert_eq!(lines[1], "P0,Root");
    assert_eq!(lines[2], "P1,");
    assert_eq!(lines[12], "P11,");
}

#[tokio::test(start_paused = true)]
async fn test_json_export_to_nested_path() {
    let mock = MockTransport::new();
    partner_pages(&mock, 7);
    let gw = gateway(&mock);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("exports").join("partners.json");
    let summary = gw
        .export_to_path(
            None,
            "res.partner",
            SearchQuery::default(),
            ExportRequest::default()
                .format(ExportFormat::Json)
                .page_size(3),
            &path,
        )
        .await
        .unwrap();
    assert_eq!(summary.exported, 7);

    let records: Vec<Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let ids: Vec<u64> = records.iter().filter_map(|r| r["id"].as_u64()).collect();
    assert_eq!(ids, (0..7).collect::<Vec<_>>());
    assert_eq!(records[0]["parent_id"], json!([1, "Root"]));
}

#[tokio::test(start_paused = true)]
async fn test_csv_export_requires_fields() {
    let mock = MockTransport::new();
    partner_pages(&mock, 3);
    let gw = gateway(&mock);

    let err = gw
        .export(
            None,
            "res.partner",
            SearchQuery::default(),
            ExportRequest::default(),
            Vec::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(mock.count_calls("res.partner", "search_read"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_switch_and_restore_instance() {
    let mock = MockTransport::new();
    let gw = gateway(&mock);

    assert_eq!(gw.switch_instance("b").unwrap(), "a");
    assert_eq!(gw.resolve_instance(None).await.unwrap().instance(), "b");

    assert_eq!(gw.switch_instance("a").unwrap(), "b");
    assert_eq!(gw.resolve_instance(None).await.unwrap().instance(), "a");
}

#[tokio::test(start_paused = true)]
async fn test_with_instance_failure_keeps_selection() {
    let mock = MockTransport::new();
    mock.on_any(|_| Ok(json!([])));
    let gw = gateway(&mock);

    let result: Result<(), GatewayError> = gw
        .with_instance("b", |scoped| async move {
            let session = scoped.resolve_instance(None).await?;
            assert_eq!(session.instance(), "b");
            Err(GatewayError::Internal("step failed".to_string()))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(gw.current_instance(), "a");
    assert_eq!(mock.calls().iter().filter(|(i, _)| i == "b").count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_cache_always_calls() {
    let mock = MockTransport::new();
    mock.on("res.partner", "search_read", |_| Ok(json!([])));
    let gw = gateway(&mock);

    for _ in 0..3 {
        gw.search_read(Some("b"), "res.partner", partner_query())
            .await
            .unwrap();
    }

    assert_eq!(mock.count_calls("res.partner", "search_read"), 3);
    assert!(gw.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_resolvers_authenticate_once() {
    let mock = MockTransport::new().with_auth_latency(Duration::from_millis(200));
    let gw = gateway(&mock);

    let (first, second) = tokio::join!(gw.resolve_instance(None), gw.resolve_instance(None));

    assert_eq!(first.unwrap().generation(), second.unwrap().generation());
    assert_eq!(mock.auth_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_environment_instance_fallback() {
    let mock = MockTransport::new();
    let env = EnvSource::fixed([
        ("STAGING_ODOO_URL", "staging.example.com"),
        ("STAGING_ODOO_DB", "staging"),
        ("STAGING_ODOO_USERNAME", "bot"),
        ("STAGING_ODOO_PASSWORD", "pw"),
    ]);
    let gw = gateway_with_env(&mock, env);

    assert_eq!(gw.list_instances(), vec!["a", "b", "staging"]);

    let session = gw.resolve_instance(Some("staging")).await.unwrap();
    assert_eq!(session.config().url, "http://staging.example.com");

    let info = gw.instance_info(Some("staging")).await.unwrap();
    assert!(info.connected);
    assert!(!info.current);
    assert_eq!(info.database, "staging");
}

#[tokio::test(start_paused = true)]
async fn test_metrics_record_calls() {
    let mock = MockTransport::new();
    mock.on_any(|_| Ok(json!([])));
    let gw = gateway(&mock);

    gw.fields_get(None, "res.partner", None).await.unwrap();
    gw.delete(None, "res.partner", vec![3]).await.unwrap();

    let operations: Vec<String> = gw
        .metrics_summary()
        .into_iter()
        .map(|s| s.operation)
        .collect();
    assert_eq!(operations, vec!["res.partner.fields_get", "res.partner.unlink"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_operations_ranked() {
    let mock = MockTransport::new().with_call_latency(Duration::from_millis(300));
    mock.on_any(|_| Ok(json!([])));
    let gw = gateway(&mock);

    gw.search_read(None, "res.partner", partner_query()).await.unwrap();
    gw.delete(None, "res.partner", vec![3]).await.unwrap();

    let slow: Vec<String> = gw
        .slow_operations(Duration::from_millis(200))
        .into_iter()
        .map(|s| s.operation)
        .collect();
    assert_eq!(slow, vec!["res.partner.search_read", "res.partner.unlink"]);
    assert!(gw.slow_operations(Duration::from_secs(1)).is_empty());
}
