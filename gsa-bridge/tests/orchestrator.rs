use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gsa_bridge::config::ConfigStore;
use gsa_bridge::config::keys::SERVER_DASHBOARD_PORT;
use gsa_bridge::connector::{Connector, ConnectorContext, DocContent, DocRequest};
use gsa_bridge::orchestrator::{LifecycleState, Orchestrator};
use gsa_bridge::push::{DocId, DocIdPusher, FeedRecord, FeedSink, FullPushStatus};
use gsa_bridge::scheduler::BackoffConfig;
use gsa_bridge::{Error, Result};

const BASE_CONFIG: &str = "\
gsa.hostname=gsa.example.com
server.hostname=localhost
server.port=0
server.dashboardPort=0
adaptor.fullListingSchedule=0 3 * * *
";

#[derive(Default)]
struct CountingConnector {
    inits: AtomicUsize,
    destroys: AtomicUsize,
    fail_init: AtomicBool,
}

#[async_trait]
impl Connector for CountingConnector {
    async fn init(&self, _context: Arc<dyn ConnectorContext>) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(Error::connector("repository offline"));
        }
        Ok(())
    }

    async fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }

    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> Result<()> {
        let ids = vec![DocId::new("a"), DocId::new("b"), DocId::new("c")];
        pusher.push_doc_ids(&ids).await?;
        Ok(())
    }

    async fn get_doc_content(&self, request: &DocRequest) -> Result<Option<DocContent>> {
        if request.doc_id.as_str() == "hello" {
            Ok(Some(
                DocContent::new("hello world").with_content_type("text/plain"),
            ))
        } else {
            Ok(None)
        }
    }
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<FeedRecord>>,
}

#[async_trait]
impl FeedSink for CollectingSink {
    async fn send_batch(&self, _feed_name: &str, records: &[FeedRecord]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

fn config(extra: &str) -> Arc<ConfigStore> {
    let store = Arc::new(ConfigStore::new());
    store.load_str(&format!("{BASE_CONFIG}{extra}")).unwrap();
    store
}

fn orchestrator(
    config: Arc<ConfigStore>,
    connector: Arc<CountingConnector>,
) -> (Orchestrator, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let orchestrator = Orchestrator::builder(config, connector)
        .feed_sink(sink.clone())
        .init_backoff(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
        })
        .build();
    (orchestrator, sink)
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_start_serves_documents_and_dashboard() {
    let connector = Arc::new(CountingConnector::default());
    let (orchestrator, _sink) = orchestrator(config(""), connector.clone());

    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state(), LifecycleState::Running);
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);

    let document_addr = orchestrator.document_addr().unwrap();
    let response = http_get(document_addr, "/doc/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("hello world"));

    let response = http_get(document_addr, "/doc/missing").await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let dashboard_addr = orchestrator.dashboard_addr().unwrap();
    let response = http_get(dashboard_addr, "/status").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("sessid_"));

    // Port 0 is replaced by the bound port.
    assert_eq!(
        orchestrator.config().snapshot().server_port().unwrap(),
        document_addr.port()
    );

    orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);
    assert!(orchestrator.document_addr().is_none());
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 1);
    assert!(TcpStream::connect(document_addr).await.is_err());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let connector = Arc::new(CountingConnector::default());
    let (orchestrator, _sink) = orchestrator(config(""), connector.clone());

    orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 0);

    orchestrator.start().await.unwrap();
    orchestrator.stop(Duration::from_secs(1)).await;
    orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);

    // A stopped service starts again.
    orchestrator.start().await.unwrap();
    assert_eq!(connector.inits.load(Ordering::SeqCst), 2);
    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_second_start_fails() {
    let connector = Arc::new(CountingConnector::default());
    let (orchestrator, _sink) = orchestrator(config(""), connector.clone());

    orchestrator.start().await.unwrap();
    assert!(matches!(
        orchestrator.start().await,
        Err(Error::AlreadyStarted)
    ));
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);
    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_schedule_change_reschedules_without_restart() {
    let connector = Arc::new(CountingConnector::default());
    let store = config("");
    let (orchestrator, _sink) = orchestrator(store.clone(), connector.clone());

    orchestrator.start().await.unwrap();
    assert_eq!(
        orchestrator.full_listing_schedule().as_deref(),
        Some("0 3 * * *")
    );

    let updated = BASE_CONFIG.replace("0 3 * * *", "30 4 * * 1-5");
    assert!(store.load_str(&updated).unwrap());

    eventually(|| orchestrator.full_listing_schedule().as_deref() == Some("30 4 * * 1-5")).await;
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.state(), LifecycleState::Running);

    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_invalid_schedule_keeps_previous() {
    let connector = Arc::new(CountingConnector::default());
    let store = config("");
    let (orchestrator, _sink) = orchestrator(store.clone(), connector.clone());
    orchestrator.start().await.unwrap();
    let before = store.snapshot();

    let updated = BASE_CONFIG.replace("0 3 * * *", "not a schedule");
    assert!(matches!(
        store.load_str(&updated),
        Err(Error::Configuration(_))
    ));
    assert!(Arc::ptr_eq(&before, &store.snapshot()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        orchestrator.full_listing_schedule().as_deref(),
        Some("0 3 * * *")
    );
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);
    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unparsable_value_is_rejected_while_running() {
    let connector = Arc::new(CountingConnector::default());
    let store = config("");
    let (orchestrator, _sink) = orchestrator(store.clone(), connector.clone());
    let fatal = orchestrator.subscribe_fatal();
    orchestrator.start().await.unwrap();
    let before = store.snapshot();

    for extra in [
        "server.maxWorkerThreads=abc\n",
        "transform.pipeline=missing\n",
        "adaptor.incrementalPollPeriodSecs=0\n",
    ] {
        let result = store.load_str(&format!("{BASE_CONFIG}{extra}"));
        assert!(matches!(result, Err(Error::Configuration(_))), "{extra}");
    }
    assert!(Arc::ptr_eq(&before, &store.snapshot()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(orchestrator.state(), LifecycleState::Running);
    assert!(fatal.borrow().is_none());
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 0);

    let response = http_get(orchestrator.document_addr().unwrap(), "/doc/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_other_change_restarts_once() {
    let connector = Arc::new(CountingConnector::default());
    let store = config("feed.maxUrls=100\n");
    let (orchestrator, _sink) = orchestrator(store.clone(), connector.clone());

    orchestrator.start().await.unwrap();
    let port = orchestrator.document_addr().unwrap().port();

    assert!(store.load_str(&format!("{BASE_CONFIG}feed.maxUrls=10\n")).unwrap());

    eventually(|| connector.inits.load(Ordering::SeqCst) == 2).await;
    eventually(|| orchestrator.state() == LifecycleState::Running).await;
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.document_addr().unwrap().port(), port);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.inits.load(Ordering::SeqCst), 2);

    let response = http_get(orchestrator.document_addr().unwrap(), "/doc/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    orchestrator.stop(Duration::from_secs(1)).await;
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 2);
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("0.0.0.0:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test]
async fn test_failed_restart_is_fatal() {
    let connector = Arc::new(CountingConnector::default());
    let base = BASE_CONFIG.replace("server.dashboardPort=0\n", "");
    let store = Arc::new(ConfigStore::new());
    store
        .load_str(&format!("{base}{SERVER_DASHBOARD_PORT}={}\n", free_port()))
        .unwrap();
    let (orchestrator, _sink) = orchestrator(store.clone(), connector.clone());
    let mut fatal = orchestrator.subscribe_fatal();
    orchestrator.start().await.unwrap();

    // The new dashboard port is valid but already taken.
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let taken_port = taken.local_addr().unwrap().port();
    assert!(
        store
            .load_str(&format!("{base}{SERVER_DASHBOARD_PORT}={taken_port}\n"))
            .unwrap()
    );

    let error = tokio::time::timeout(Duration::from_secs(10), fatal.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert!(matches!(*error, Error::RestartFailed(_)));
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);
    assert!(orchestrator.document_addr().is_none());
    assert_eq!(connector.inits.load(Ordering::SeqCst), 1);
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 1);
    drop(taken);
}

#[tokio::test]
async fn test_init_is_retried_until_success() {
    let connector = Arc::new(CountingConnector::default());
    connector.fail_init.store(true, Ordering::SeqCst);
    let (orchestrator, _sink) = orchestrator(config(""), connector.clone());
    let orchestrator = Arc::new(orchestrator);

    let starting = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    eventually(|| connector.inits.load(Ordering::SeqCst) >= 3).await;
    assert_eq!(orchestrator.state(), LifecycleState::Starting);
    connector.fail_init.store(false, Ordering::SeqCst);

    starting.await.unwrap().unwrap();
    assert_eq!(orchestrator.state(), LifecycleState::Running);
    orchestrator.stop(Duration::from_secs(1)).await;
}

/// Fails init until the configuration file says the repository is ready.
#[derive(Default)]
struct FileGatedConnector {
    inits: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Connector for FileGatedConnector {
    async fn init(&self, context: Arc<dyn ConnectorContext>) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let marker = context
            .config()
            .snapshot()
            .raw_value("connector.marker")
            .unwrap_or_default()
            .to_string();
        self.seen.lock().push(marker.clone());
        if marker == "ready" {
            Ok(())
        } else {
            Err(Error::connector("repository not ready"))
        }
    }

    async fn destroy(&self) {}

    async fn get_doc_ids(&self, _pusher: &dyn DocIdPusher) -> Result<()> {
        Ok(())
    }

    async fn get_doc_content(&self, _request: &DocRequest) -> Result<Option<DocContent>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_init_retry_reloads_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adaptor-config.properties");
    std::fs::write(&path, format!("{BASE_CONFIG}connector.marker=waiting\n")).unwrap();

    let store = Arc::new(ConfigStore::new());
    assert!(store.load_file(&path).await.unwrap());

    let connector = Arc::new(FileGatedConnector::default());
    let orchestrator = Arc::new(
        Orchestrator::builder(store.clone(), connector.clone())
            .init_backoff(BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            })
            .build(),
    );

    let starting = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    eventually(|| connector.inits.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(orchestrator.state(), LifecycleState::Starting);

    std::fs::write(&path, format!("{BASE_CONFIG}connector.marker=ready\n")).unwrap();
    // Coarse filesystem timestamps would otherwise hide the rewrite.
    std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(10))
        .unwrap();

    starting.await.unwrap().unwrap();
    let seen = connector.seen.lock().clone();
    assert_eq!(seen.first().map(String::as_str), Some("waiting"));
    assert_eq!(seen.last().map(String::as_str), Some("ready"));
    assert_eq!(
        store.snapshot().raw_value("connector.marker"),
        Some("ready")
    );

    eventually(|| orchestrator.state() == LifecycleState::Running).await;
    orchestrator.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_aborts_init_retries() {
    let connector = Arc::new(CountingConnector::default());
    connector.fail_init.store(true, Ordering::SeqCst);
    let (orchestrator, _sink) = orchestrator(config(""), connector.clone());
    let orchestrator = Arc::new(orchestrator);

    let starting = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    eventually(|| connector.inits.load(Ordering::SeqCst) >= 2).await;
    orchestrator.begin_shutdown();

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(Error::ShuttingDown)));
    assert_eq!(orchestrator.state(), LifecycleState::Stopped);
    assert!(orchestrator.document_addr().is_none());
    assert_eq!(connector.destroys.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_immediate_push() {
    let connector = Arc::new(CountingConnector::default());
    let (orchestrator, sink) = orchestrator(config(""), connector.clone());

    assert!(!orchestrator.check_and_schedule_immediate_push_of_doc_ids());

    orchestrator.start().await.unwrap();
    assert!(orchestrator.check_and_schedule_immediate_push_of_doc_ids());

    eventually(|| orchestrator.journal().last_full_push().is_some()).await;
    let outcome = orchestrator.journal().last_full_push().unwrap();
    assert_eq!(outcome.status, FullPushStatus::Success);

    let pushed: Vec<String> = sink
        .records
        .lock()
        .iter()
        .map(|r| r.doc_id.as_str().to_string())
        .collect();
    assert_eq!(pushed, vec!["a", "b", "c"]);

    orchestrator.stop(Duration::from_secs(1)).await;
}
