//! End-to-end session tests against the mock collaborators.
//!
//! These drive [`LockerClient`] through whole sessions: scanning, the
//! handshake, retries and the network fallback.

use std::sync::Arc;
use std::time::Duration;

use locker_core::mock::{
    MockKeyService, MockLocationProvider, MockLockerDirectory, MockNetworkClient, MockPrompt,
    MockTransport, Reply, TransportCall, mock_link,
};
use locker_core::{
    ActionKind, AuthorizationStatus, Coordinates, Error, LockerClient, StageFailure, UnlockPath,
};

const LOCKER: &str = "locker-001";
const TOKEN: &str = "user-token";

/// A payload meaning nothing has been written yet.
const FRESH: &[u8] = b"2478699286901811";

fn is_connect(call: &TransportCall) -> bool {
    matches!(call, TransportCall::Connect { .. })
}

fn is_write(call: &TransportCall) -> bool {
    matches!(call, TransportCall::Write { .. })
}

fn is_read(call: &TransportCall) -> bool {
    matches!(call, TransportCall::Read { .. })
}

struct Fixture {
    transport: Arc<MockTransport>,
    keys: Arc<MockKeyService>,
    directory: Arc<MockLockerDirectory>,
    network: Arc<MockNetworkClient>,
    location: Arc<MockLocationProvider>,
    prompt: Arc<MockPrompt>,
}

impl Fixture {
    fn new(transport: MockTransport) -> Self {
        Self::with(
            transport,
            MockLockerDirectory::new(),
            MockLocationProvider::authorized(35.6812, 139.7671),
        )
    }

    fn with(
        transport: MockTransport,
        directory: MockLockerDirectory,
        location: MockLocationProvider,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            keys: Arc::new(MockKeyService::new()),
            directory: Arc::new(directory),
            network: Arc::new(MockNetworkClient::new()),
            location: Arc::new(location),
            prompt: Arc::new(MockPrompt::new()),
        }
    }

    fn client(&self) -> LockerClient {
        LockerClient::builder(self.transport.clone())
            .key_service(self.keys.clone())
            .directory(self.directory.clone())
            .network(self.network.clone())
            .location(self.location.clone())
            .prompt(self.prompt.clone())
            .build()
            .unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_target_not_discovered() {
    let fixture = Fixture::new(MockTransport::new().with_locker("locker-999"));
    let client = fixture.client();

    let err = client.put(TOKEN, LOCKER).await.unwrap_err();
    assert!(matches!(err, Error::DeviceNotFound(_)));
    assert!(err.to_string().contains(LOCKER));
    assert_eq!(fixture.transport.count_calls(is_connect).await, 0);
    assert!(!client.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_wireless_put_succeeds() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_read(Reply::Value(FRESH.to_vec()))
        .with_read(Reply::Value(b"wsuccess".to_vec()));
    let fixture = Fixture::new(transport);
    let client = fixture.client();

    let path = client.put(TOKEN, LOCKER).await.unwrap();
    assert_eq!(path, UnlockPath::Wireless);

    let calls = fixture.transport.calls().await;
    let link = mock_link(LOCKER);
    assert_eq!(calls.first(), Some(&TransportCall::StartScan));
    assert!(calls.contains(&TransportCall::StopScan));
    assert_eq!(calls.last(), Some(&TransportCall::Disconnect { link }));
    assert!(calls.iter().any(|c| matches!(
        c,
        TransportCall::Write { data, .. } if data == b"MOCK-KEY"
    )));

    assert_eq!(fixture.keys.get_key_count(), 1);
    let saved = fixture.keys.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].read_data(), "wsuccess");

    // The wireless path never consults the directory
    assert_eq!(fixture.directory.lookup_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_capable_locker_switches_after_first_failure() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_read(Reply::Value(FRESH.to_vec()))
        .with_write(Reply::Error("GATT write rejected".into()));
    let fixture = Fixture::with(
        transport,
        MockLockerDirectory::new().network_capable(),
        MockLocationProvider::authorized(35.6812, 139.7671),
    );
    let client = fixture.client();

    let path = client.put(TOKEN, LOCKER).await.unwrap();
    assert_eq!(path, UnlockPath::Network);

    // No second wireless attempt
    assert_eq!(fixture.transport.count_calls(is_connect).await, 1);
    assert_eq!(fixture.transport.count_calls(is_write).await, 1);
    assert_eq!(
        fixture.transport.calls().await.last(),
        Some(&TransportCall::Disconnect {
            link: mock_link(LOCKER)
        })
    );

    assert_eq!(fixture.location.location_requests(), 1);
    let calls = fixture.network.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, ActionKind::Put);
    assert_eq!(calls[0].token, TOKEN);
    assert_eq!(calls[0].locker_id, LOCKER);
    assert_eq!(
        calls[0].location,
        Coordinates {
            lat: 35.6812,
            lng: 139.7671
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_exhausts_retries_without_fallback() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_read(Reply::Error("read error 1".into()))
        .with_read(Reply::Error("read error 2".into()))
        .with_read(Reply::Error("read error 3".into()));
    let fixture = Fixture::with(
        transport,
        MockLockerDirectory::new().network_capable(),
        MockLocationProvider::authorized(1.0, 2.0),
    );
    let client = fixture.client();

    let err = client.read(LOCKER).await.unwrap_err();
    match err {
        Error::ReadFailed(StageFailure::Transport(message)) => {
            assert_eq!(message, "read error 3")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(fixture.transport.count_calls(is_connect).await, 3);
    assert_eq!(fixture.transport.count_calls(is_read).await, 3);
    assert_eq!(fixture.directory.lookup_count(), 0);
    assert!(fixture.network.calls().await.is_empty());
    assert_eq!(fixture.location.location_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_discovery_batch_is_ignored() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_locker(LOCKER)
        .with_read(Reply::Value(FRESH.to_vec()));
    let fixture = Fixture::new(transport);
    let client = fixture.client();

    let path = client.put(TOKEN, LOCKER).await.unwrap();
    assert_eq!(path, UnlockPath::Wireless);
    assert_eq!(fixture.transport.count_calls(is_connect).await, 1);
    assert_eq!(fixture.keys.save_key_count(), 1);
    assert!(!fixture.transport.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_read_returns_payload() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_read(Reply::Value(b"rwsuccess\0\0".to_vec()));
    let fixture = Fixture::new(transport);
    let client = fixture.client();

    let payload = client.read(LOCKER).await.unwrap();
    assert_eq!(payload, "rwsuccess");
    assert_eq!(fixture.transport.count_calls(is_write).await, 0);
    assert_eq!(fixture.keys.get_key_count(), 0);
    assert_eq!(fixture.keys.save_key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_last_error() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_default_read(Reply::Value(FRESH.to_vec()))
        .with_write(Reply::Error("write 1".into()))
        .with_write(Reply::Error("write 2".into()))
        .with_write(Reply::Error("write 3".into()));
    let fixture = Fixture::new(transport);
    let client = fixture.client();

    let err = client.put(TOKEN, LOCKER).await.unwrap_err();
    match err {
        Error::WriteFailed(StageFailure::Transport(message)) => assert_eq!(message, "write 3"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fixture.transport.count_calls(is_write).await, 3);
    assert_eq!(fixture.keys.save_key_count(), 0);
    // Wireless-only locker: one lookup on the first retry
    assert_eq!(fixture.directory.lookup_count(), 1);
    assert_eq!(
        fixture.transport.calls().await.last(),
        Some(&TransportCall::Disconnect {
            link: mock_link(LOCKER)
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_write_timeout_then_already_written() {
    // First attempt writes but the acknowledgement never arrives; on the
    // retry the locker already reports the target state.
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_read(Reply::Value(FRESH.to_vec()))
        .with_write(Reply::Silent)
        .with_read(Reply::Value(b"using".to_vec()));
    let fixture = Fixture::new(transport);
    let client = fixture.client();

    let path = client.put(TOKEN, LOCKER).await.unwrap();
    assert_eq!(path, UnlockPath::Wireless);
    assert_eq!(fixture.transport.count_calls(is_connect).await, 2);
    assert_eq!(fixture.transport.count_calls(is_write).await, 1);
    assert_eq!(fixture.keys.get_key_count(), 1);
    assert_eq!(fixture.keys.save_key_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lookup_error_continues_wireless_retries() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_default_read(Reply::Value(FRESH.to_vec()))
        .with_write(Reply::Error("write 1".into()));
    let fixture = Fixture::new(transport);
    fixture.directory.fail_with("directory unavailable");
    let client = fixture.client();

    let path = client.put(TOKEN, LOCKER).await.unwrap();
    assert_eq!(path, UnlockPath::Wireless);
    assert_eq!(fixture.directory.lookup_count(), 1);
    assert_eq!(fixture.transport.count_calls(is_write).await, 2);
    assert!(fixture.network.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_network_error_is_terminal() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_connect(Reply::Error("connection refused".into()));
    let fixture = Fixture::with(
        transport,
        MockLockerDirectory::new().network_capable(),
        MockLocationProvider::authorized(1.0, 2.0),
    );
    fixture.network.fail_with("locker offline");
    let client = fixture.client();

    let err = client.take(TOKEN, LOCKER).await.unwrap_err();
    assert!(matches!(err, Error::NetworkFailed(message) if message == "locker offline"));
    assert_eq!(fixture.transport.count_calls(is_connect).await, 1);
    assert_eq!(fixture.network.calls().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_denied_location_fails_fallback() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_connect(Reply::Silent);
    let location =
        MockLocationProvider::authorized(1.0, 2.0).with_status(AuthorizationStatus::Denied);
    location.close_changes();
    let fixture = Fixture::with(
        transport,
        MockLockerDirectory::new().network_capable(),
        location,
    );
    let client = fixture.client();

    let err = client.open_for_maintenance(TOKEN, LOCKER).await.unwrap_err();
    assert!(matches!(err, Error::LocationPermissionDenied));
    assert_eq!(fixture.prompt.shown_count(), 1);
    assert_eq!(fixture.location.location_requests(), 0);
    assert!(fixture.network.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_is_retried() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_services(Reply::Silent)
        .with_read(Reply::Value(FRESH.to_vec()));
    let fixture = Fixture::new(transport);
    let client = Arc::new(fixture.client());

    let session = tokio::spawn({
        let client = client.clone();
        async move { client.put(TOKEN, LOCKER).await }
    });
    while fixture.transport.count_calls(|c| matches!(c, TransportCall::DiscoverServices { .. })).await
        == 0
    {
        tokio::task::yield_now().await;
    }
    fixture
        .transport
        .emit(locker_core::TransportEvent::Disconnected {
            link: mock_link(LOCKER),
        });

    assert_eq!(session.await.unwrap().unwrap(), UnlockPath::Wireless);
    assert_eq!(fixture.transport.count_calls(is_connect).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_put_requires_token_value() {
    let fixture = Fixture::new(MockTransport::new().with_locker(LOCKER));
    let client = fixture.client();

    let session = locker_core::RequestSession::new(ActionKind::Take, None, LOCKER);
    let err = client.run(session).await.unwrap_err();
    assert!(matches!(err, Error::MissingToken(ActionKind::Take)));
    assert!(fixture.transport.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_key_service_fails_each_attempt() {
    let transport = MockTransport::new()
        .with_locker(LOCKER)
        .with_default_read(Reply::Value(FRESH.to_vec()));
    let fixture = Fixture::new(transport);
    fixture.keys.stall();
    let client = fixture.client();

    let result = tokio::time::timeout(Duration::from_secs(3600), client.put(TOKEN, LOCKER))
        .await
        .expect("session should end on its own");
    assert!(matches!(result, Err(Error::KeyCapabilityFailed(_))));

    assert_eq!(fixture.keys.get_key_count(), 3);
    assert_eq!(fixture.transport.count_calls(is_connect).await, 3);
    assert_eq!(fixture.transport.count_calls(is_write).await, 0);
    assert_eq!(
        fixture.transport.calls().await.last(),
        Some(&TransportCall::Disconnect {
            link: mock_link(LOCKER)
        })
    );
    assert!(!client.is_busy());
}
