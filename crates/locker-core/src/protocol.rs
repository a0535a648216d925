//! Locker handshake state machine.
//!
//! A [`Handshake`] drives one physical link through
//! connect, service discovery, characteristic discovery, read, key
//! derivation, write, read-back and key save. It is fed one input at a time
//! by the session task ([`Handshake::on_event`], [`Handshake::on_timer`])
//! and reports [`Progress::Finished`] exactly once per attempt; after that
//! it ignores every input until the next [`Handshake::start`].
//!
//! Every timed stage arms its timer from the [`TimeoutSet`] when it begins
//! and clears it when the stage's completion event is observed. A timer
//! firing is treated as that stage's failure. Key service calls are awaited
//! in place under their own deadline.
//!
//! Completions are matched to the operation ids the current attempt
//! started, so a late completion from an abandoned attempt is dropped.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use locker_types::{
    ActionKind, CharacteristicHandle, LinkHandle, LockerDevice, ProtocolStatus, ServiceHandle,
    decode_payload,
};

use crate::error::{Error, Result, StageFailure};
use crate::events::{OperationId, TransportEvent, TransportResult};
use crate::timeouts::{Stage, TimeoutSet, TimerFired};
use crate::traits::{KeyService, Transport};

/// What a successful handshake produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The key exchange completed and was saved.
    Saved,
    /// Read-only handshake: the decoded payload.
    Payload(String),
}

/// Result of feeding one input to the handshake.
#[derive(Debug)]
pub enum Progress {
    /// The attempt is still running (or the input was ignored).
    Pending,
    /// The attempt reached its terminal outcome.
    Finished(Result<HandshakeOutcome>),
}

impl Progress {
    /// Whether this is a terminal outcome.
    pub fn is_finished(&self) -> bool {
        matches!(self, Progress::Finished(_))
    }
}

/// Current handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// No attempt in progress.
    Idle,
    /// Waiting for the link to open.
    Connecting,
    /// Waiting for the service list.
    DiscoveringServices,
    /// Waiting for characteristic lists; `pending` services have not
    /// answered yet.
    DiscoveringCharacteristics {
        /// Services still to answer.
        pending: usize,
        /// Last error reported by a service.
        last_error: Option<StageFailure>,
    },
    /// Reading the payload before any write.
    ReadingPreWrite,
    /// Waiting for the key service.
    GettingKey,
    /// Waiting for the write acknowledgement.
    Writing,
    /// Reading the payload after the write.
    ReadingPostWrite,
    /// Waiting for the key service to save.
    SavingKey,
}

impl HandshakeState {
    fn timed_stage(&self) -> Option<Stage> {
        match self {
            HandshakeState::Connecting => Some(Stage::Connecting),
            HandshakeState::DiscoveringServices => Some(Stage::DiscoveringServices),
            HandshakeState::DiscoveringCharacteristics { .. } => {
                Some(Stage::DiscoveringCharacteristics)
            }
            HandshakeState::ReadingPreWrite => Some(Stage::ReadingPreWrite),
            HandshakeState::Writing => Some(Stage::Writing),
            HandshakeState::ReadingPostWrite => Some(Stage::ReadingPostWrite),
            HandshakeState::Idle | HandshakeState::GettingKey | HandshakeState::SavingKey => None,
        }
    }
}

/// Handshake state machine for one locker link.
pub struct Handshake {
    transport: Arc<dyn Transport>,
    keys: Option<Arc<dyn KeyService>>,
    action: ActionKind,
    device: LockerDevice,
    timers: TimeoutSet,
    state: HandshakeState,
    retry: u32,
    characteristic: Option<CharacteristicHandle>,
    outstanding: Vec<OperationId>,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("action", &self.action)
            .field("device", &self.device)
            .field("state", &self.state)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Handshake {
    /// Create a handshake for `device`.
    ///
    /// `keys` may be `None` only for [`ActionKind::Read`], which never
    /// derives or saves a key.
    pub fn new(
        transport: Arc<dyn Transport>,
        keys: Option<Arc<dyn KeyService>>,
        action: ActionKind,
        device: LockerDevice,
        timers: TimeoutSet,
    ) -> Self {
        Self {
            transport,
            keys,
            action,
            device,
            timers,
            state: HandshakeState::Idle,
            retry: 0,
            characteristic: None,
            outstanding: Vec::new(),
        }
    }

    /// The locker record as last updated by the handshake.
    pub fn device(&self) -> &LockerDevice {
        &self.device
    }

    /// Current state.
    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Whether an attempt is in progress.
    pub fn is_active(&self) -> bool {
        self.state != HandshakeState::Idle
    }

    /// The physical link, if the locker has one.
    pub fn link(&self) -> Option<&LinkHandle> {
        self.device.link.as_ref()
    }

    /// Begin an attempt. `retry` is 0 for the first attempt.
    ///
    /// The device record is reset to [`ProtocolStatus::None`] first, so
    /// every attempt starts from the same state.
    pub async fn start(&mut self, retry: u32) -> Progress {
        self.timers.clear_all();
        self.device.reset_for_attempt();
        self.characteristic = None;
        self.outstanding.clear();
        self.retry = retry;

        let Some(link) = self.device.link.clone() else {
            self.state = HandshakeState::Connecting;
            return self.finish(Err(Error::LinkUnavailable));
        };

        info!(locker = %self.device.id, retry, "Starting handshake");
        self.enter(HandshakeState::Connecting);
        let started = self.transport.connect(&link).await;
        if let Err(e) = self.track(started) {
            return self.stage_failed(Stage::Connecting, StageFailure::Transport(e.to_string()));
        }
        Progress::Pending
    }

    /// Feed a transport event.
    pub async fn on_event(&mut self, event: &TransportEvent) -> Progress {
        if !self.is_active() {
            return Progress::Pending;
        }

        let Some(link) = self.device.link.clone() else {
            return Progress::Pending;
        };
        match event.link() {
            Some(event_link) if *event_link == link => {}
            // Scan events belong to the session, not the handshake
            None => return Progress::Pending,
            Some(other) => {
                debug!(link = %other, "Ignoring event for another link");
                return Progress::Pending;
            }
        }
        if let Some(op) = event.operation() {
            let Some(index) = self.outstanding.iter().position(|o| *o == op) else {
                debug!(%op, "Ignoring completion of an operation this attempt did not start");
                return Progress::Pending;
            };
            self.outstanding.swap_remove(index);
        }

        match event {
            TransportEvent::Connected { result, .. } => self.on_connected(&link, result).await,
            TransportEvent::ServicesDiscovered { result, .. } => {
                self.on_services(&link, result).await
            }
            TransportEvent::CharacteristicsDiscovered {
                service, result, ..
            } => self.on_characteristics(&link, service, result).await,
            TransportEvent::ValueRead {
                characteristic,
                result,
                ..
            } => self.on_read(&link, characteristic, result).await,
            TransportEvent::ValueWritten {
                characteristic,
                result,
                ..
            } => self.on_written(&link, characteristic, result).await,
            TransportEvent::Disconnected { .. } => {
                warn!(locker = %self.device.id, state = ?self.state, "Link lost during handshake");
                self.finish(Err(Error::LinkUnavailable))
            }
            _ => Progress::Pending,
        }
    }

    /// Feed a stage timer firing.
    pub fn on_timer(&mut self, fired: &TimerFired) -> Progress {
        let Some(duration) = self.timers.accept(fired) else {
            debug!(stage = %fired.stage, "Ignoring stale stage timer");
            return Progress::Pending;
        };
        if self.state.timed_stage() != Some(fired.stage) {
            debug!(stage = %fired.stage, state = ?self.state, "Timer fired outside its stage");
            return Progress::Pending;
        }

        warn!(locker = %self.device.id, stage = %fired.stage, ?duration, "Stage timed out");
        self.stage_failed(fired.stage, StageFailure::TimedOut { duration })
    }

    async fn on_connected(&mut self, link: &LinkHandle, result: &TransportResult<()>) -> Progress {
        if !self.expect_state(Stage::Connecting) {
            return Progress::Pending;
        }
        self.timers.clear(Stage::Connecting);
        if let Err(e) = result {
            return self.stage_failed(Stage::Connecting, e.clone().into());
        }

        self.enter(HandshakeState::DiscoveringServices);
        let started = self.transport.discover_services(link).await;
        if let Err(e) = self.track(started) {
            return self.stage_failed(
                Stage::DiscoveringServices,
                StageFailure::Transport(e.to_string()),
            );
        }
        Progress::Pending
    }

    async fn on_services(
        &mut self,
        link: &LinkHandle,
        result: &TransportResult<Vec<ServiceHandle>>,
    ) -> Progress {
        if !self.expect_state(Stage::DiscoveringServices) {
            return Progress::Pending;
        }
        self.timers.clear(Stage::DiscoveringServices);

        let services = match result {
            Ok(services) if !services.is_empty() => services,
            Ok(_) => return self.stage_failed(Stage::DiscoveringServices, StageFailure::MissingValue),
            Err(e) => return self.stage_failed(Stage::DiscoveringServices, e.clone().into()),
        };
        debug!(count = services.len(), "Services discovered");

        self.enter(HandshakeState::DiscoveringCharacteristics {
            pending: services.len(),
            last_error: None,
        });
        for service in services {
            let started = self.transport.discover_characteristics(link, service).await;
            if let Err(e) = self.track(started) {
                let failure = StageFailure::Transport(e.to_string());
                if let Some(progress) = self.service_answered(Some(failure)) {
                    return progress;
                }
            }
        }
        Progress::Pending
    }

    async fn on_characteristics(
        &mut self,
        link: &LinkHandle,
        service: &ServiceHandle,
        result: &TransportResult<Vec<CharacteristicHandle>>,
    ) -> Progress {
        if !self.expect_state(Stage::DiscoveringCharacteristics) {
            return Progress::Pending;
        }

        let failure = match result {
            Ok(characteristics) => match characteristics.first() {
                Some(characteristic) => {
                    debug!(service = %service.uuid, characteristic = %characteristic.uuid, "Characteristic selected");
                    self.timers.clear(Stage::DiscoveringCharacteristics);
                    self.characteristic = Some(*characteristic);
                    return self.begin_read(link, HandshakeState::ReadingPreWrite).await;
                }
                None => None,
            },
            Err(e) => Some(StageFailure::from(e.clone())),
        };

        self.service_answered(failure).unwrap_or(Progress::Pending)
    }

    /// Count one service answer without a usable characteristic. Returns
    /// the terminal progress once every service has answered.
    fn service_answered(&mut self, failure: Option<StageFailure>) -> Option<Progress> {
        let HandshakeState::DiscoveringCharacteristics {
            pending,
            last_error,
        } = &mut self.state
        else {
            return None;
        };

        *pending = pending.saturating_sub(1);
        if failure.is_some() {
            *last_error = failure;
        }
        if *pending > 0 {
            return None;
        }

        let failure = last_error.take().unwrap_or(StageFailure::MissingValue);
        Some(self.stage_failed(Stage::DiscoveringCharacteristics, failure))
    }

    async fn begin_read(&mut self, link: &LinkHandle, state: HandshakeState) -> Progress {
        let Some(characteristic) = self.characteristic else {
            return self.finish(Err(Error::CharacteristicNotFound(StageFailure::MissingValue)));
        };
        let stage = match state {
            HandshakeState::ReadingPostWrite => Stage::ReadingPostWrite,
            _ => Stage::ReadingPreWrite,
        };

        self.enter(state);
        let started = self.transport.read(link, &characteristic).await;
        if let Err(e) = self.track(started) {
            return self.stage_failed(stage, StageFailure::Transport(e.to_string()));
        }
        Progress::Pending
    }

    async fn on_read(
        &mut self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
        result: &TransportResult<Vec<u8>>,
    ) -> Progress {
        if self.characteristic.as_ref() != Some(characteristic) {
            debug!(characteristic = %characteristic.uuid, "Ignoring read of another characteristic");
            return Progress::Pending;
        }
        let stage = match self.state {
            HandshakeState::ReadingPreWrite if self.device.status() == ProtocolStatus::None => {
                Stage::ReadingPreWrite
            }
            HandshakeState::ReadingPostWrite
                if self.device.status() == ProtocolStatus::WroteOnce =>
            {
                Stage::ReadingPostWrite
            }
            _ => {
                debug!(state = ?self.state, "Ignoring read completion outside a read stage");
                return Progress::Pending;
            }
        };
        self.timers.clear(stage);

        let payload = match result {
            Ok(bytes) => decode_payload(bytes),
            Err(e) => return self.stage_failed(stage, e.clone().into()),
        };
        info!(locker = %self.device.id, %stage, payload = %payload, "Characteristic read");
        self.device.set_read_data(payload);

        if stage == Stage::ReadingPostWrite {
            return self.save_key().await;
        }

        if self.action == ActionKind::Read {
            let payload = self.device.read_data().to_string();
            return self.finish(Ok(HandshakeOutcome::Payload(payload)));
        }

        if self.retry > 0 && self.action.is_already_written(self.device.read_data()) {
            info!(
                locker = %self.device.id,
                payload = %self.device.read_data(),
                "Locker already in target state, skipping write"
            );
            return self.save_key().await;
        }

        self.get_key_and_write(link).await
    }

    async fn get_key_and_write(&mut self, link: &LinkHandle) -> Progress {
        let Some(keys) = self.keys.clone() else {
            return self.finish(Err(Error::key_failed("no key service configured")));
        };
        let Some(characteristic) = self.characteristic else {
            return self.finish(Err(Error::CharacteristicNotFound(StageFailure::MissingValue)));
        };

        self.enter(HandshakeState::GettingKey);
        let key = match self.key_call(keys.get_key(&self.device)).await {
            Ok(key) => key,
            Err(e) => {
                warn!(locker = %self.device.id, error = %e, "Key service failed");
                return self.finish(Err(e));
            }
        };

        self.enter(HandshakeState::Writing);
        let started = self.transport.write(link, &characteristic, &key).await;
        if let Err(e) = self.track(started) {
            return self.stage_failed(Stage::Writing, StageFailure::Transport(e.to_string()));
        }
        Progress::Pending
    }

    async fn on_written(
        &mut self,
        link: &LinkHandle,
        characteristic: &CharacteristicHandle,
        result: &TransportResult<()>,
    ) -> Progress {
        if !self.expect_state(Stage::Writing) {
            return Progress::Pending;
        }
        if self.characteristic.as_ref() != Some(characteristic) {
            debug!(characteristic = %characteristic.uuid, "Ignoring write ack for another characteristic");
            return Progress::Pending;
        }
        self.timers.clear(Stage::Writing);

        if let Err(e) = result {
            return self.stage_failed(Stage::Writing, e.clone().into());
        }
        self.device.mark_written();
        self.begin_read(link, HandshakeState::ReadingPostWrite).await
    }

    async fn save_key(&mut self) -> Progress {
        let Some(keys) = self.keys.clone() else {
            return self.finish(Err(Error::key_failed("no key service configured")));
        };

        self.enter(HandshakeState::SavingKey);
        match self.key_call(keys.save_key(&self.device)).await {
            Ok(()) => self.finish(Ok(HandshakeOutcome::Saved)),
            Err(e) => {
                warn!(locker = %self.device.id, error = %e, "Saving key failed");
                self.finish(Err(e))
            }
        }
    }

    /// Await a key service call, failing it once the key service deadline
    /// passes.
    async fn key_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        let deadline = self.timers.durations().key_service;
        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::key_failed(format!(
                "key service did not answer within {:?}",
                deadline
            ))),
        }
    }

    /// Remember a started operation so its completion is accepted.
    fn track(&mut self, started: Result<OperationId>) -> Result<()> {
        let op = started?;
        self.outstanding.push(op);
        Ok(())
    }

    /// Move to `state`, arming its stage timer if it has one.
    fn enter(&mut self, state: HandshakeState) {
        if let Some(stage) = self.state.timed_stage() {
            self.timers.clear(stage);
        }
        if let Some(stage) = state.timed_stage() {
            self.timers.set(stage);
        }
        debug!(locker = %self.device.id, from = ?self.state, to = ?state, "Handshake transition");
        self.state = state;
    }

    fn expect_state(&self, stage: Stage) -> bool {
        if self.state.timed_stage() == Some(stage) {
            return true;
        }
        debug!(%stage, state = ?self.state, "Ignoring completion for inactive stage");
        false
    }

    fn stage_failed(&mut self, stage: Stage, failure: StageFailure) -> Progress {
        let error = stage.failure(failure);
        warn!(locker = %self.device.id, %stage, error = %error, "Handshake stage failed");
        self.finish(Err(error))
    }

    fn finish(&mut self, result: Result<HandshakeOutcome>) -> Progress {
        self.timers.clear_all();
        self.outstanding.clear();
        self.state = HandshakeState::Idle;
        match &result {
            Ok(outcome) => info!(locker = %self.device.id, ?outcome, "Handshake succeeded"),
            Err(e) => debug!(locker = %self.device.id, error = %e, "Handshake attempt ended"),
        }
        Progress::Finished(result)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::events::EventReceiver;
    use crate::mock::{
        MOCK_CHARACTERISTIC_UUID, MOCK_SERVICE_UUID, MockKeyService, MockTransport, Reply,
        TransportCall,
    };
    use crate::timeouts::StageTimeouts;

    const LINK: &str = "MOCK-LINK";

    struct Harness {
        handshake: Handshake,
        transport: Arc<MockTransport>,
        keys: Arc<MockKeyService>,
        events: EventReceiver,
        timers: mpsc::UnboundedReceiver<TimerFired>,
    }

    impl Harness {
        fn new(action: ActionKind, transport: MockTransport) -> Self {
            let transport = Arc::new(transport);
            let keys = Arc::new(MockKeyService::new());
            let (tx, timers) = mpsc::unbounded_channel();
            let device = LockerDevice::new("locker-1", Some(LinkHandle::new(LINK)));
            let handshake = Handshake::new(
                transport.clone(),
                Some(keys.clone()),
                action,
                device,
                TimeoutSet::new(StageTimeouts::uniform(Duration::from_secs(1)), tx),
            );
            let events = transport.subscribe();
            Self {
                handshake,
                transport,
                keys,
                events,
                timers,
            }
        }

        /// Run one attempt to completion, dispatching events and timers the
        /// way the session task does.
        async fn run(&mut self, retry: u32) -> Result<HandshakeOutcome> {
            let mut progress = self.handshake.start(retry).await;
            loop {
                if let Progress::Finished(result) = progress {
                    return result;
                }
                progress = tokio::select! {
                    Ok(event) = self.events.recv() => self.handshake.on_event(&event).await,
                    Some(fired) = self.timers.recv() => self.handshake.on_timer(&fired),
                };
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_write_handshake() {
        let transport = MockTransport::new()
            .with_read(Reply::Value(b"2478699286901811".to_vec()))
            .with_read(Reply::Value(b"wsuccess".to_vec()));
        let mut h = Harness::new(ActionKind::Put, transport);

        let outcome = h.run(0).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Saved);
        assert_eq!(h.handshake.device().status(), ProtocolStatus::WroteOnce);
        assert_eq!(h.handshake.device().read_data(), "wsuccess");
        assert_eq!(h.keys.get_key_count(), 1);
        assert_eq!(h.keys.save_key_count(), 1);
        assert!(!h.handshake.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_action_stops_after_first_read() {
        let transport = MockTransport::new().with_read(Reply::Value(b"using\0".to_vec()));
        let mut h = Harness::new(ActionKind::Read, transport);

        let outcome = h.run(0).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Payload("using".to_string()));
        assert_eq!(h.keys.get_key_count(), 0);
        assert_eq!(h.keys.save_key_count(), 0);
        let calls = h.transport.calls().await;
        assert!(!calls.iter().any(|c| matches!(c, TransportCall::Write { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_write_when_already_written() {
        let transport = MockTransport::new().with_read(Reply::Value(b"rwsuccess".to_vec()));
        let mut h = Harness::new(ActionKind::Take, transport);

        let outcome = h.run(1).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Saved);
        assert_eq!(h.keys.get_key_count(), 0);
        assert_eq!(h.keys.save_key_count(), 1);
        assert_eq!(h.handshake.device().status(), ProtocolStatus::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_always_writes() {
        let transport = MockTransport::new()
            .with_read(Reply::Value(b"rwsuccess".to_vec()))
            .with_read(Reply::Value(b"wsuccess".to_vec()));
        let mut h = Harness::new(ActionKind::Take, transport);

        h.run(0).await.unwrap();
        assert_eq!(h.keys.get_key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_retry_with_using_writes() {
        let transport = MockTransport::new()
            .with_read(Reply::Value(b"using".to_vec()))
            .with_read(Reply::Value(b"wsuccess".to_vec()));
        let mut h = Harness::new(ActionKind::Take, transport);

        h.run(2).await.unwrap();
        assert_eq!(h.keys.get_key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_services_fail() {
        let transport = MockTransport::new().with_services(Reply::Value(vec![]));
        let mut h = Harness::new(ActionKind::Put, transport);

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ServiceNotFound(StageFailure::MissingValue)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = MockTransport::new().with_connect(Reply::Silent);
        let mut h = Harness::new(ActionKind::Put, transport);

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_error() {
        let transport = MockTransport::new()
            .with_read(Reply::Value(b"0000".to_vec()))
            .with_write(Reply::Error("GATT 0x03".to_string()));
        let mut h = Harness::new(ActionKind::Put, transport);

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(err, Error::WriteFailed(StageFailure::Transport(_))));
        assert_eq!(h.handshake.device().status(), ProtocolStatus::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_write_read_timeout() {
        let transport = MockTransport::new()
            .with_read(Reply::Value(b"0000".to_vec()))
            .with_read(Reply::Silent);
        let mut h = Harness::new(ActionKind::Put, transport);

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ReadFailed(StageFailure::TimedOut { .. })
        ));
        assert_eq!(h.handshake.device().status(), ProtocolStatus::WroteOnce);
        assert_eq!(h.keys.save_key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_failure_propagates_unmodified() {
        let transport = MockTransport::new().with_read(Reply::Value(b"0000".to_vec()));
        let mut h = Harness::new(ActionKind::Put, transport);
        h.keys.fail_get_key("key server offline");

        let err = h.run(0).await.unwrap_err();
        match err {
            Error::KeyCapabilityFailed(msg) => assert_eq!(msg, "key server offline"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_service_provides_characteristic() {
        let services = vec![
            ServiceHandle::new(Uuid::from_u128(0xA)),
            ServiceHandle::new(Uuid::from_u128(0xB)),
        ];
        let transport = MockTransport::new()
            .with_services(Reply::Value(services))
            .with_characteristics(Reply::Value(vec![]))
            .with_characteristics(Reply::Default)
            .with_read(Reply::Value(b"using".to_vec()));
        let mut h = Harness::new(ActionKind::Read, transport);

        let outcome = h.run(0).await.unwrap();
        assert_eq!(outcome, HandshakeOutcome::Payload("using".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_characteristic_on_any_service() {
        let services = vec![
            ServiceHandle::new(Uuid::from_u128(0xA)),
            ServiceHandle::new(Uuid::from_u128(0xB)),
        ];
        let transport = MockTransport::new()
            .with_services(Reply::Value(services))
            .with_characteristics(Reply::Error("insufficient auth".to_string()))
            .with_characteristics(Reply::Value(vec![]));
        let mut h = Harness::new(ActionKind::Put, transport);

        let err = h.run(0).await.unwrap_err();
        match err {
            Error::CharacteristicNotFound(StageFailure::Transport(msg)) => {
                assert_eq!(msg, "insufficient auth")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_attempt() {
        let transport = MockTransport::new().with_services(Reply::Silent);
        let mut h = Harness::new(ActionKind::Put, transport);

        let mut progress = h.handshake.start(0).await;
        while !progress.is_finished() {
            let event = h.events.recv().await.unwrap();
            progress = h.handshake.on_event(&event).await;
            if matches!(event, TransportEvent::Connected { .. }) {
                let lost = TransportEvent::Disconnected {
                    link: LinkHandle::new(LINK),
                };
                progress = h.handshake.on_event(&lost).await;
            }
        }
        assert!(matches!(
            progress,
            Progress::Finished(Err(Error::LinkUnavailable))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_ignored_after_finish() {
        let transport = MockTransport::new().with_read(Reply::Value(b"using".to_vec()));
        let mut h = Harness::new(ActionKind::Read, transport);
        h.run(0).await.unwrap();

        let late = TransportEvent::ValueRead {
            link: LinkHandle::new(LINK),
            op: h.transport.last_operation().unwrap(),
            characteristic: mock_characteristic(),
            result: Ok(b"wsuccess".to_vec()),
        };
        assert!(!h.handshake.on_event(&late).await.is_finished());
        assert_eq!(h.handshake.device().read_data(), "using");
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_other_link_ignored() {
        let transport = MockTransport::new().with_connect(Reply::Silent);
        let mut h = Harness::new(ActionKind::Put, transport);
        h.handshake.start(0).await;

        let other = TransportEvent::Connected {
            link: LinkHandle::new("OTHER"),
            op: h.transport.last_operation().unwrap(),
            result: Ok(()),
        };
        assert!(!h.handshake.on_event(&other).await.is_finished());
        assert_eq!(h.handshake.state(), &HandshakeState::Connecting);
    }

    fn mock_characteristic() -> CharacteristicHandle {
        CharacteristicHandle::new(ServiceHandle::new(MOCK_SERVICE_UUID), MOCK_CHARACTERISTIC_UUID)
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_read_from_earlier_attempt_ignored() {
        let transport = MockTransport::new()
            .with_read(Reply::Silent)
            .with_read(Reply::Silent);
        let mut h = Harness::new(ActionKind::Read, transport);

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(err, Error::ReadFailed(StageFailure::TimedOut { .. })));
        let abandoned = h.transport.last_operation().unwrap();

        // Bring the next attempt up to its own pre-write read
        let mut progress = h.handshake.start(1).await;
        while h.handshake.state() != &HandshakeState::ReadingPreWrite {
            let event = h.events.recv().await.unwrap();
            progress = h.handshake.on_event(&event).await;
        }
        assert!(!progress.is_finished());

        let late = TransportEvent::ValueRead {
            link: LinkHandle::new(LINK),
            op: abandoned,
            characteristic: mock_characteristic(),
            result: Ok(b"rwsuccess".to_vec()),
        };
        assert!(!h.handshake.on_event(&late).await.is_finished());
        assert_eq!(h.handshake.state(), &HandshakeState::ReadingPreWrite);

        let current = TransportEvent::ValueRead {
            link: LinkHandle::new(LINK),
            op: h.transport.last_operation().unwrap(),
            characteristic: mock_characteristic(),
            result: Ok(b"using".to_vec()),
        };
        match h.handshake.on_event(&current).await {
            Progress::Finished(Ok(outcome)) => {
                assert_eq!(outcome, HandshakeOutcome::Payload("using".to_string()))
            }
            other => panic!("unexpected progress: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_get_key_times_out() {
        let transport = MockTransport::new().with_read(Reply::Value(b"2478699286901811".to_vec()));
        let mut h = Harness::new(ActionKind::Put, transport);
        h.keys.stall();

        let err = h.run(0).await.unwrap_err();
        assert!(matches!(err, Error::KeyCapabilityFailed(_)));
        assert!(!h.handshake.is_active());
        assert_eq!(h.keys.get_key_count(), 1);
        let calls = h.transport.calls().await;
        assert!(!calls.iter().any(|c| matches!(c, TransportCall::Write { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_save_key_times_out() {
        let transport = MockTransport::new().with_read(Reply::Value(b"rwsuccess".to_vec()));
        let mut h = Harness::new(ActionKind::Take, transport);
        h.keys.stall();

        let err = h.run(1).await.unwrap_err();
        assert!(matches!(err, Error::KeyCapabilityFailed(_)));
        assert_eq!(h.keys.save_key_count(), 1);
        assert!(h.keys.saved().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_link() {
        let transport = Arc::new(MockTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handshake = Handshake::new(
            transport,
            None,
            ActionKind::Read,
            LockerDevice::new("locker-1", None),
            TimeoutSet::new(StageTimeouts::default(), tx),
        );
        let progress = handshake.start(0).await;
        assert!(matches!(
            progress,
            Progress::Finished(Err(Error::LinkUnavailable))
        ));
    }
}
