//! One caller-initiated locker action, from scan to terminal outcome.
//!
//! A [`SessionDriver`] owns everything mutable about a session: the phase,
//! the retry counter and the handshake. It runs as a single task that
//! consumes transport events and stage-timer firings from one
//! `tokio::select!` loop, so no state is touched concurrently. The outcome
//! is delivered once through a [`Completion`].

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use locker_types::{ActionKind, LinkHandle};

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::events::{DiscoveredLocker, TransportEvent};
use crate::location::LocationFallback;
use crate::protocol::{Handshake, HandshakeOutcome, Progress};
use crate::retry::is_retryable;
use crate::timeouts::{TimeoutSet, TimerFired};
use crate::traits::{
    KeyService, LocationProvider, LockerDirectory, NetworkClient, RemediationPrompt, Transport,
};

/// One requested action. Immutable for the lifetime of the session.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestSession {
    /// What to do.
    pub action: ActionKind,
    /// Authorization token; absent for read-only actions.
    pub token: Option<String>,
    /// Target locker identifier.
    pub locker_id: String,
}

impl RequestSession {
    /// Create a session value.
    pub fn new(action: ActionKind, token: Option<String>, locker_id: impl Into<String>) -> Self {
        Self {
            action,
            token,
            locker_id: locker_id.into(),
        }
    }

    /// A read-only session.
    pub fn read(locker_id: impl Into<String>) -> Self {
        Self::new(ActionKind::Read, None, locker_id)
    }
}

// Keep tokens out of logs
impl fmt::Debug for RequestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSession")
            .field("action", &self.action)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("locker_id", &self.locker_id)
            .finish()
    }
}

/// Which path unlocked the locker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockPath {
    /// The wireless handshake completed.
    Wireless,
    /// The location-authenticated network request completed.
    Network,
}

impl fmt::Display for UnlockPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockPath::Wireless => write!(f, "wireless"),
            UnlockPath::Network => write!(f, "network"),
        }
    }
}

/// Terminal success value of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A put/take/maintenance action completed.
    Unlocked(UnlockPath),
    /// A read action completed with the decoded payload.
    Payload(String),
}

/// Where a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the target locker to be discovered.
    Scanning,
    /// Running handshake attempts over the link.
    Handshaking,
    /// Running the network fallback.
    Fallback,
    /// The outcome has been delivered.
    Resolved,
}

/// Single-shot delivery of a session's outcome.
///
/// The first [`Completion::resolve`] sends the result; every later call is
/// logged and dropped.
#[derive(Debug)]
pub struct Completion<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Completion<T> {
    /// Create a completion and the receiver its outcome arrives on.
    pub fn new() -> (Self, oneshot::Receiver<Result<T>>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Deliver the outcome. Returns `false` if one was already delivered.
    pub fn resolve(&mut self, result: Result<T>) -> bool {
        match self.sender.take() {
            Some(sender) => {
                // Receiver gone means the caller stopped waiting
                let _ = sender.send(result);
                true
            }
            None => {
                if let Err(e) = &result {
                    warn!(error = %e, "Dropping late session failure");
                } else {
                    warn!("Dropping late session success");
                }
                false
            }
        }
    }

    /// Whether the outcome has been delivered.
    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }
}

/// The collaborators a session drives.
#[derive(Clone)]
pub(crate) struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub keys: Option<Arc<dyn KeyService>>,
    pub directory: Option<Arc<dyn LockerDirectory>>,
    pub network: Option<Arc<dyn NetworkClient>>,
    pub location: Option<Arc<dyn LocationProvider>>,
    pub prompt: Option<Arc<dyn RemediationPrompt>>,
}

impl Collaborators {
    fn fallback(&self) -> Option<LocationFallback> {
        match (&self.location, &self.network) {
            (Some(location), Some(network)) => Some(LocationFallback::new(
                Arc::clone(location),
                Arc::clone(network),
                self.prompt.clone(),
            )),
            _ => None,
        }
    }
}

/// What to do after a failed attempt.
enum AfterFailure {
    Retry,
    Done(Result<SessionOutcome>),
}

enum Input {
    Event(TransportEvent),
    Timer(TimerFired),
    Closed,
}

/// Drives one [`RequestSession`] to its outcome.
pub(crate) struct SessionDriver {
    session: RequestSession,
    config: ClientConfig,
    collaborators: Collaborators,
    phase: SessionPhase,
    retry: u32,
    fallback_engaged: bool,
}

impl SessionDriver {
    pub(crate) fn new(
        session: RequestSession,
        config: ClientConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            session,
            config,
            collaborators,
            phase: SessionPhase::Scanning,
            retry: 0,
            fallback_engaged: false,
        }
    }

    /// Run the session to its outcome.
    pub(crate) async fn run(mut self) -> Result<SessionOutcome> {
        let result = self.drive().await;
        let reached = std::mem::replace(&mut self.phase, SessionPhase::Resolved);
        match &result {
            Ok(outcome) => info!(
                locker = %self.session.locker_id,
                phase = ?reached,
                ?outcome,
                "Session succeeded"
            ),
            Err(e) => info!(
                locker = %self.session.locker_id,
                phase = ?reached,
                error = %e,
                retries = self.retry,
                fallback = self.fallback_engaged,
                "Session failed"
            ),
        }
        result
    }

    async fn drive(&mut self) -> Result<SessionOutcome> {
        let transport = Arc::clone(&self.collaborators.transport);
        let mut events = transport.subscribe();
        let (timer_tx, mut timers) = mpsc::unbounded_channel();
        let mut timer_tx = Some(timer_tx);
        let mut handshake: Option<Handshake> = None;

        info!(locker = %self.session.locker_id, action = %self.session.action, "Scanning for locker");
        transport.start_scan().await?;

        loop {
            let input = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => Input::Event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session lagged behind transport events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => Input::Closed,
                },
                Some(fired) = timers.recv() => Input::Timer(fired),
            };

            let progress = match (input, handshake.as_mut()) {
                (Input::Event(TransportEvent::Discovered { lockers }), None) => {
                    let Some(locker) = self.match_target(lockers) else {
                        continue;
                    };
                    self.stop_scan().await;
                    let Some(timer_tx) = timer_tx.take() else {
                        continue;
                    };
                    let link = locker.link.clone();
                    info!(locker = %locker.id, %link, "Locker found");
                    self.phase = SessionPhase::Handshaking;

                    let timers = TimeoutSet::new(self.config.stage_timeouts.clone(), timer_tx);
                    let hs = handshake.insert(Handshake::new(
                        Arc::clone(&transport),
                        self.collaborators.keys.clone(),
                        self.session.action,
                        locker.into_device(),
                        timers,
                    ));
                    hs.start(self.retry).await
                }
                (Input::Event(TransportEvent::ScanFinished), None) => {
                    return Err(Error::device_not_found(&self.session.locker_id));
                }
                (
                    Input::Event(
                        TransportEvent::Discovered { .. } | TransportEvent::ScanFinished,
                    ),
                    Some(_),
                ) => {
                    debug!("Ignoring scan event after the locker was found");
                    self.stop_scan().await;
                    continue;
                }
                (Input::Event(event), Some(hs)) => hs.on_event(&event).await,
                (Input::Timer(fired), Some(hs)) => hs.on_timer(&fired),
                (Input::Event(_) | Input::Timer(_), None) => continue,
                (Input::Closed, hs) => {
                    warn!("Transport event stream closed");
                    if let Some(link) = hs.and_then(|hs| hs.link().cloned()) {
                        self.disconnect(&link).await;
                    }
                    return Err(Error::LinkUnavailable);
                }
            };

            if let Some(hs) = handshake.as_mut()
                && let Some(result) = self.settle(hs, progress).await
            {
                return result;
            }
        }
    }

    fn match_target(&self, lockers: Vec<DiscoveredLocker>) -> Option<DiscoveredLocker> {
        let found = lockers
            .into_iter()
            .find(|locker| locker.id == self.session.locker_id);
        if found.is_none() {
            debug!("Discovery batch without the target locker");
        }
        found
    }

    /// Apply the retry policy until the handshake is pending again or the
    /// session has an outcome.
    async fn settle(
        &mut self,
        handshake: &mut Handshake,
        mut progress: Progress,
    ) -> Option<Result<SessionOutcome>> {
        loop {
            let Progress::Finished(result) = progress else {
                return None;
            };

            let link = handshake.link().cloned();
            match result {
                Ok(outcome) => {
                    if let Some(link) = &link {
                        self.disconnect(link).await;
                    }
                    return Some(Ok(match outcome {
                        HandshakeOutcome::Saved => SessionOutcome::Unlocked(UnlockPath::Wireless),
                        HandshakeOutcome::Payload(payload) => SessionOutcome::Payload(payload),
                    }));
                }
                Err(error) => match self.after_failure(link.as_ref(), error).await {
                    AfterFailure::Retry => progress = handshake.start(self.retry).await,
                    AfterFailure::Done(result) => return Some(result),
                },
            }
        }
    }

    async fn after_failure(&mut self, link: Option<&LinkHandle>, error: Error) -> AfterFailure {
        if !is_retryable(&error) {
            if let Some(link) = link {
                self.disconnect(link).await;
            }
            return AfterFailure::Done(Err(error));
        }

        self.retry += 1;

        if self.retry == 1 && self.prefers_network().await {
            if let Some(link) = link {
                self.disconnect(link).await;
            }
            return AfterFailure::Done(self.run_fallback(error).await);
        }

        if !self.config.retry.should_retry(self.retry) {
            warn!(
                locker = %self.session.locker_id,
                attempts = self.retry,
                error = %error,
                "Wireless retries exhausted"
            );
            if let Some(link) = link {
                self.disconnect(link).await;
            }
            return AfterFailure::Done(Err(error));
        }

        let delay = self.config.retry.delay_for_retry(self.retry);
        warn!(
            locker = %self.session.locker_id,
            retry = self.retry,
            max_attempts = self.config.retry.max_attempts,
            ?delay,
            error = %error,
            "Handshake attempt failed, retrying"
        );
        if !delay.is_zero() {
            sleep(delay).await;
        }
        AfterFailure::Retry
    }

    /// Whether the locker should be operated over the network instead.
    async fn prefers_network(&self) -> bool {
        if !self.session.action.has_network_fallback() {
            return false;
        }
        let Some(token) = self.session.token.as_deref() else {
            return false;
        };
        let Some(directory) = &self.collaborators.directory else {
            debug!("No locker directory configured, skipping network check");
            return false;
        };
        if self.collaborators.location.is_none() || self.collaborators.network.is_none() {
            debug!("Network fallback not configured");
            return false;
        }

        match directory.get_locker(token, &self.session.locker_id).await {
            Ok(info) => {
                debug!(network_capable = info.network_capable, "Locker metadata");
                info.network_capable
            }
            Err(e) => {
                warn!(error = %e, "Locker lookup failed, continuing wireless retries");
                false
            }
        }
    }

    async fn run_fallback(&mut self, cause: Error) -> Result<SessionOutcome> {
        let Some(mut fallback) = self.collaborators.fallback() else {
            return Err(cause);
        };
        info!(locker = %self.session.locker_id, cause = %cause, "Switching to network fallback");
        self.phase = SessionPhase::Fallback;
        self.fallback_engaged = true;

        fallback
            .run(&self.session, cause)
            .await
            .map(|()| SessionOutcome::Unlocked(UnlockPath::Network))
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.collaborators.transport.stop_scan().await {
            warn!(error = %e, "Failed to stop scan");
        }
    }

    async fn disconnect(&self, link: &LinkHandle) {
        debug!(%link, "Disconnecting");
        if let Err(e) = self.collaborators.transport.disconnect(link).await {
            warn!(%link, error = %e, "Failed to disconnect");
        }
    }
}
