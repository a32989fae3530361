use flate2::read::GzDecoder;
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::buffer::Batch;
use telemetry_channel::reliability::DiskConfig;
use telemetry_channel::sender::{
    AuthorizationError, AuthorizationProvider, IngestionResponse, RedirectPhase,
    SUPPRESS_INSTRUMENTATION_HEADER, Sender, SenderConfig, SenderError, StaticTokenProvider,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const TRACK_PATH: &str = "/v2.1/track";

fn sender_config(endpoint: String, disk_retry: bool) -> SenderConfig {
    SenderConfig {
        endpoint,
        instrumentation_key: "test-ikey".to_string(),
        timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(2),
        disk_retry_enabled: disk_retry,
        ..SenderConfig::default()
    }
}

fn disk_config(dir: &TempDir) -> DiskConfig {
    DiskConfig {
        storage_dir: DiskConfig::storage_dir_for(dir.path(), "test-ikey"),
        ..DiskConfig::default()
    }
}

fn sender_for(server: &MockServer, dir: &TempDir, disk_retry: bool) -> Sender {
    Sender::new(
        sender_config(format!("{}{TRACK_PATH}", server.uri()), disk_retry),
        disk_config(dir),
        None,
    )
    .unwrap()
}

fn test_batch(n: usize) -> Batch {
    Batch::new((0..n).map(|i| format!(r#"{{"item":{i}}}"#)).collect())
}

fn gunzip(request: &Request) -> String {
    let mut decoded = String::new();
    GzDecoder::new(request.body.as_slice())
        .read_to_string(&mut decoded)
        .unwrap();
    decoded
}

#[tokio::test]
async fn test_accepted_batch_is_sent_gzipped_with_stream_headers() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path(TRACK_PATH))
        .and(header("content-type", "application/x-json-stream"))
        .and(header("content-encoding", "gzip"))
        .and(header(SUPPRESS_INSTRUMENTATION_HEADER, "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(r#"{"itemsReceived":2,"itemsAccepted":2,"errors":[]}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, false);
    let batch = test_batch(2);
    let outcome = sender.send_batch(batch.clone()).await.unwrap();

    assert!(outcome.is_accepted());
    assert_eq!(outcome.status, 200);
    assert_eq!(outcome.persisted_items, 0);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(gunzip(&requests[0]), batch.payload());
    assert_eq!(sender.stats().total_requests, 1);
}

#[tokio::test]
async fn test_circular_redirect_abandons_after_limit() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let endpoint = format!("{}{TRACK_PATH}", server.uri());
    Mock::given(method("POST"))
        .and(path(TRACK_PATH))
        .respond_with(ResponseTemplate::new(308).insert_header("Location", endpoint.as_str()))
        .expect(10)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    let result = sender.send_batch(test_batch(1)).await;

    assert!(matches!(
        result,
        Err(SenderError::CircularRedirect { redirects: 10 })
    ));
    assert_eq!(sender.state().redirect_phase(), RedirectPhase::Abandoned);
    // Abandoned batches are not persisted.
    assert!(sender.store().list_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_redirect_target_is_remembered() {
    let origin = MockServer::start().await;
    let regional = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let regional_endpoint = format!("{}/regional/track", regional.uri());

    Mock::given(method("POST"))
        .and(path(TRACK_PATH))
        .respond_with(
            ResponseTemplate::new(307).insert_header("Location", regional_endpoint.as_str()),
        )
        .expect(1)
        .mount(&origin)
        .await;
    Mock::given(method("POST"))
        .and(path("/regional/track"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&regional)
        .await;

    let sender = sender_for(&origin, &dir, false);
    assert!(sender.send_batch(test_batch(1)).await.unwrap().is_accepted());
    assert!(sender.send_batch(test_batch(1)).await.unwrap().is_accepted());

    assert_eq!(
        sender.state().redirect_url().map(|u| u.to_string()),
        Some(regional_endpoint)
    );
    assert_eq!(sender.state().redirect_phase(), RedirectPhase::Direct);
    assert_eq!(sender.stats().consecutive_redirects, 0);
}

#[tokio::test]
async fn test_relative_redirect_resolves_against_request_url() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(path(TRACK_PATH))
        .respond_with(ResponseTemplate::new(308).insert_header("Location", "/moved/track"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/moved/track"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, false);
    assert!(sender.send_batch(test_batch(1)).await.unwrap().is_accepted());
}

#[tokio::test]
async fn test_redirect_without_location_is_terminal() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(307))
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    assert!(matches!(
        sender.send_batch(test_batch(1)).await,
        Err(SenderError::RedirectWithoutLocation { status: 307 })
    ));
}

#[tokio::test]
async fn test_partial_failure_persists_only_retriable_items() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let body = r#"{"itemsReceived":4,"itemsAccepted":1,"errors":[
        {"index":0,"statusCode":500,"message":"Internal"},
        {"index":2,"statusCode":400,"message":"Invalid"},
        {"index":3,"statusCode":429,"message":"Throttled"}]}"#;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(206).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    let batch = test_batch(4);
    let outcome = sender.send_batch(batch.clone()).await.unwrap();

    assert_eq!(outcome.status, 206);
    assert_eq!(outcome.persisted_items, 2);
    let stored = sender.store().load_oldest().await.unwrap().unwrap();
    assert_eq!(stored.items(), [batch.items()[0].clone(), batch.items()[3].clone()]);
}

#[tokio::test]
async fn test_unparseable_retriable_response_persists_whole_batch() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    let batch = test_batch(3);
    let outcome = sender.send_batch(batch.clone()).await.unwrap();

    assert!(matches!(
        outcome.response,
        IngestionResponse::PartialFailure {
            status: 503,
            errors: None
        }
    ));
    assert_eq!(outcome.persisted_items, 3);
    let stored = sender.store().load_oldest().await.unwrap().unwrap();
    assert_eq!(stored.items(), batch.items());
}

#[tokio::test]
async fn test_retriable_response_without_disk_retry_persists_nothing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, false);
    let outcome = sender.send_batch(test_batch(2)).await.unwrap();

    assert_eq!(outcome.persisted_items, 0);
    assert!(!sender.store().storage_dir().exists());
}

#[tokio::test]
async fn test_non_retriable_status_drops_batch() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    let outcome = sender.send_batch(test_batch(2)).await.unwrap();

    assert_eq!(outcome.response, IngestionResponse::Fatal { status: 400 });
    assert_eq!(outcome.body, "bad request");
    assert!(sender.store().list_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_network_error_persists_batch_when_disk_retry_enabled() {
    let dir = TempDir::new().unwrap();
    // Nothing listens on port 1.
    let sender = Sender::new(
        sender_config("http://127.0.0.1:1/v2.1/track".to_string(), true),
        disk_config(&dir),
        None,
    )
    .unwrap();

    let result = sender.send_batch(test_batch(2)).await;
    assert!(matches!(result, Err(SenderError::Network(_))));
    assert_eq!(sender.stats().consecutive_failures, 1);
    assert_eq!(sender.store().list_records().await.unwrap().len(), 1);

    let _ = sender.send_batch(test_batch(1)).await;
    assert_eq!(sender.stats().consecutive_failures, 2);
    assert_eq!(sender.stats().persisted_batches, 2);
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn count(&self, level: &str, message: &str) -> usize {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .filter(|line| line.contains(level) && line.contains(message))
            .count()
    }
}

async fn log_unreachable_failures(disk_retry: bool, attempts: usize) -> CapturedLogs {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let sender = Sender::new(
        sender_config("http://127.0.0.1:1/v2.1/track".to_string(), disk_retry),
        disk_config(&dir),
        None,
    )
    .unwrap();
    for _ in 0..attempts {
        assert!(sender.send_batch(test_batch(1)).await.is_err());
    }
    assert_eq!(sender.stats().consecutive_failures, attempts as u32);
    sender.shutdown();
    logs
}

#[tokio::test]
async fn test_sustained_outage_warns_on_first_and_every_fifth_failure() {
    const UNREACHABLE: &str = "Ingestion endpoint could not be reached";

    for disk_retry in [true, false] {
        let logs = log_unreachable_failures(disk_retry, 10).await;

        // Failures 1, 5 and 10 warn, the rest go to info.
        assert_eq!(logs.count(" WARN ", UNREACHABLE), 3, "disk_retry={disk_retry}");
        assert_eq!(logs.count(" INFO ", UNREACHABLE), 7, "disk_retry={disk_retry}");

        let detail = if disk_retry {
            "retried from disk"
        } else {
            "has been lost"
        };
        assert_eq!(logs.count(" WARN ", detail), 3, "disk_retry={disk_retry}");
    }
}

#[tokio::test]
async fn test_static_token_is_attached() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sender = Sender::new(
        sender_config(format!("{}{TRACK_PATH}", server.uri()), false),
        disk_config(&dir),
        Some(Arc::new(StaticTokenProvider::new("s3cret"))),
    )
    .unwrap();

    assert!(sender.send_batch(test_batch(1)).await.unwrap().is_accepted());
}

struct UnavailableToken;

impl AuthorizationProvider for UnavailableToken {
    fn add_authorization_header<'a>(
        &'a self,
        _headers: &'a mut HeaderMap,
    ) -> BoxFuture<'a, Result<(), AuthorizationError>> {
        Box::pin(async {
            Err(AuthorizationError::TokenUnavailable(
                "identity service down".to_string(),
            ))
        })
    }
}

#[tokio::test]
async fn test_authorization_failure_persists_without_sending() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let sender = Sender::new(
        sender_config(format!("{}{TRACK_PATH}", server.uri()), true),
        disk_config(&dir),
        Some(Arc::new(UnavailableToken)),
    )
    .unwrap();

    let result = sender.send_batch(test_batch(2)).await;
    assert!(matches!(result, Err(SenderError::Authorization(_))));
    assert_eq!(sender.store().list_records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_success_schedules_resend_of_persisted_batch() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = sender_config(format!("{}{TRACK_PATH}", server.uri()), true);
    config.resend_interval = Duration::from_millis(50);
    let sender = Sender::new(config, disk_config(&dir), None).unwrap();

    let failed = test_batch(2);
    sender.send_batch(failed.clone()).await.unwrap();
    assert_eq!(sender.store().list_records().await.unwrap().len(), 1);

    sender.send_batch(test_batch(1)).await.unwrap();
    assert!(sender.has_pending_resend());

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.received_requests().await.unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(gunzip(&requests[2]), failed.payload());
    assert!(sender.store().list_records().await.unwrap().is_empty());
    sender.shutdown();
}

#[tokio::test]
async fn test_send_first_file_on_disk() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let sender = sender_for(&server, &dir, true);
    assert!(sender.send_first_file_on_disk().await.is_none());

    let batch = test_batch(3);
    sender.store().store_to_disk(&batch).await.unwrap();

    let outcome = sender.send_first_file_on_disk().await.unwrap().unwrap();
    assert!(outcome.is_accepted());
    let requests = server.received_requests().await.unwrap();
    assert_eq!(gunzip(&requests[0]), batch.payload());
    assert!(sender.store().list_records().await.unwrap().is_empty());
    sender.shutdown();
}

#[tokio::test]
async fn test_save_on_crash_respects_disk_retry_mode() {
    let dir = TempDir::new().unwrap();
    let sender = Sender::new(
        sender_config("http://127.0.0.1:1/v2.1/track".to_string(), false),
        disk_config(&dir),
        None,
    )
    .unwrap();

    sender.save_on_crash(&test_batch(2));
    assert!(sender.store().list_records().await.unwrap().is_empty());

    sender.set_disk_retry_mode(true);
    sender.save_on_crash(&test_batch(2));
    assert_eq!(sender.store().list_records().await.unwrap().len(), 1);
    sender.shutdown();
}

#[tokio::test]
async fn test_rejects_invalid_configuration() {
    let dir = TempDir::new().unwrap();

    let mut config = sender_config("https://dc.example.com/v2.1/track".to_string(), false);
    config.max_redirects = 0;
    assert!(matches!(
        Sender::new(config, disk_config(&dir), None),
        Err(SenderError::InvalidConfiguration(_))
    ));

    let config = sender_config("::not a url::".to_string(), false);
    assert!(matches!(
        Sender::new(config, disk_config(&dir), None),
        Err(SenderError::InvalidConfiguration(_))
    ));
}
