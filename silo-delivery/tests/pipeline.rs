use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use silo_common::Signal;
use silo_delivery::{DeliveryError, IntakeError, Silo, SiloHandle, StoreRequest, TestTransport};
use silo_store::{Schema, TestStore};
use tokio::{sync::broadcast, task::JoinHandle};

struct Running {
    handle: SiloHandle,
    store: TestStore,
    transport: TestTransport,
    shutdown: broadcast::Sender<Signal>,
    task: JoinHandle<Result<(), DeliveryError>>,
}

impl Running {
    fn start(silo: Silo, transport: TestTransport) -> Self {
        let mut silo = silo;
        let store = TestStore::new(&Schema::default());
        silo.init(Arc::new(store.clone()), Arc::new(transport.clone()))
            .expect("Failed to initialise delivery");

        let handle = silo.handle().expect("Delivery should be initialised");
        let (shutdown, receiver) = broadcast::channel(4);
        let task = tokio::spawn(async move { silo.serve(receiver).await });

        Self {
            handle,
            store,
            transport,
            shutdown,
            task,
        }
    }

    fn rows(&self) -> usize {
        self.store.memory().len(&Schema::default().table)
    }

    async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("Delivery did not shut down")
            .unwrap();
        assert!(result.is_ok());
    }
}

/// Small waits so a test run takes seconds, not minutes
const FAST: &str = "workers: 2, wait_ms: 20, check_time_secs: 1";

fn silo(extra: &str) -> Silo {
    ron::from_str(&format!("({FAST}, {extra})")).expect("Invalid delivery config")
}

fn message(user: &str, body: &str) -> StoreRequest {
    StoreRequest {
        from: "sip:bob@example.org".to_string(),
        to: format!("sip:{user}@example.org"),
        owner_user: user.to_string(),
        owner_host: "example.org".to_string(),
        body: body.to_string(),
        ..StoreRequest::default()
    }
}

async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dumped_messages_are_delivered_and_removed() {
    let running = Running::start(silo(""), TestTransport::new(200));

    running.handle.store_message(&message("alice", "first")).unwrap();
    running.handle.store_message(&message("alice", "second")).unwrap();
    running.handle.store_message(&message("carol", "not yet")).unwrap();
    assert_eq!(running.rows(), 3);

    assert_eq!(running.handle.dump("alice", "example.org").unwrap(), 2);
    // Nothing new to queue while the first dump is outstanding
    assert_eq!(running.handle.dump("alice", "example.org").unwrap(), 0);

    assert!(eventually(Duration::from_secs(10), || running.rows() == 1).await);

    let sent = running.transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(request, _)| request.uri == "sip:alice@example.org"));

    let stats = running.handle.stats();
    assert_eq!(stats.stored, 3);
    assert_eq!(stats.dumped_messages, 2);
    assert_eq!(running.handle.queued(), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_deliveries_retry_then_stay_stored() {
    let running = Running::start(silo("retry_count: 2"), TestTransport::new(408));

    let id = running.handle.store_message(&message("dave", "hello")).unwrap();
    assert!(!running.handle.was_already_handled(id));
    running.handle.enqueue_retry(id, 0, 0).unwrap();

    assert!(eventually(Duration::from_secs(10), || running.handle.stats().failed_messages == 1).await);

    assert_eq!(running.transport.attempts(id), vec![0, 1, 2]);
    assert_eq!(running.handle.stats().retried, 2);
    assert_eq!(running.rows(), 1);
    assert_eq!(running.handle.queued(), 0);

    // Reconciled, so a later dump may try again
    assert!(!running.handle.was_already_handled(id));

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quota_refuses_extra_messages() {
    let running = Running::start(silo("max_messages: 1"), TestTransport::new(200));

    running.handle.store_message(&message("erin", "one")).unwrap();
    let refused = running.handle.store_message(&message("erin", "two"));

    assert!(matches!(
        refused,
        Err(DeliveryError::Intake(IntakeError::QuotaExceeded { limit: 1, .. }))
    ));
    assert_eq!(running.rows(), 1);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_reconciles_completed_work() {
    let running = Running::start(
        ron::from_str("(workers: 2, wait_ms: 20, check_time_secs: 3600)").unwrap(),
        TestTransport::new(200),
    );

    let id = running.handle.store_message(&message("frank", "bye")).unwrap();
    running.handle.was_already_handled(id);
    running.handle.enqueue_retry(id, 0, 0).unwrap();

    assert!(eventually(Duration::from_secs(5), || !running.transport.sent().is_empty()).await);
    let store = running.store.clone();
    running.stop().await;

    assert_eq!(store.memory().len(&Schema::default().table), 0);
}

#[test]
fn batch_size_beyond_one_reload_query_is_refused() {
    let mut oversized = silo("batch_size: 200");
    let result = oversized.init(
        Arc::new(TestStore::new(&Schema::default())),
        Arc::new(TestTransport::new(200)),
    );

    assert!(matches!(
        result,
        Err(DeliveryError::System(silo_delivery::SystemError::Configuration(_)))
    ));
    assert!(oversized.handle().is_err());
}
