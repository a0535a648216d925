//! Public entry point for locker actions.
//!
//! [`LockerClient`] turns `put`/`take`/`open_for_maintenance`/`read` calls
//! into sessions. Each call runs in its own task and the client serves one
//! session at a time; a call made while another is in flight fails with
//! [`Error::Busy`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use locker_core::{BtleOptions, BtleTransport, ClientConfig, LockerClient};
//!
//! # async fn example() -> locker_core::Result<()> {
//! let transport = BtleTransport::new(BtleOptions::default()).await?;
//! let client = LockerClient::builder(Arc::new(transport))
//!     .config(ClientConfig::challenging_environment())
//!     .build()?;
//!
//! let payload = client.read("locker-001").await?;
//! println!("locker reports '{}'", payload);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use locker_types::ActionKind;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::{
    Collaborators, Completion, RequestSession, SessionDriver, SessionOutcome, UnlockPath,
};
use crate::timeouts::StageTimeouts;
use crate::traits::{
    KeyService, LocationProvider, LockerDirectory, NetworkClient, RemediationPrompt, Transport,
};

/// Configuration for locker sessions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientConfig {
    /// Timeout for each handshake stage.
    pub stage_timeouts: StageTimeouts,
    /// Wireless retry policy.
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorter timeouts for lockers close by with a strong signal.
    pub fn fast() -> Self {
        Self {
            stage_timeouts: StageTimeouts::default()
                .connecting(Duration::from_secs(8))
                .discovery(Duration::from_secs(5))
                .read(Duration::from_secs(5))
                .write(Duration::from_secs(5)),
            retry: RetryPolicy::default(),
        }
    }

    /// Longer timeouts and paced retries for weak signals or busy RF
    /// environments.
    pub fn challenging_environment() -> Self {
        Self {
            stage_timeouts: StageTimeouts::default()
                .connecting(Duration::from_secs(25))
                .discovery(Duration::from_secs(15))
                .read(Duration::from_secs(15))
                .write(Duration::from_secs(15)),
            retry: RetryPolicy::patient(),
        }
    }

    /// Set the stage timeouts.
    #[must_use]
    pub fn stage_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.stage_timeouts = timeouts;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.stage_timeouts.validate()?;
        self.retry.validate()
    }
}

/// Marks the client busy for as long as it lives.
struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(busy: &Arc<AtomicBool>) -> Result<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(Self {
            busy: Arc::clone(busy),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Runs locker actions against one transport.
pub struct LockerClient {
    collaborators: Collaborators,
    config: ClientConfig,
    busy: Arc<AtomicBool>,
}

impl std::fmt::Debug for LockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockerClient")
            .field("config", &self.config)
            .field("busy", &self.is_busy())
            .field("has_key_service", &self.collaborators.keys.is_some())
            .field("has_network_fallback", &self.has_network_fallback())
            .finish()
    }
}

impl LockerClient {
    /// Start building a client around `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> LockerClientBuilder {
        LockerClientBuilder::new(transport)
    }

    /// The session configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a session is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether network-capable lockers can be operated over the network.
    pub fn has_network_fallback(&self) -> bool {
        self.collaborators.directory.is_some()
            && self.collaborators.network.is_some()
            && self.collaborators.location.is_some()
    }

    /// Deposit into a locker.
    #[tracing::instrument(skip(self, token))]
    pub async fn put(&self, token: &str, locker_id: &str) -> Result<UnlockPath> {
        let session = RequestSession::new(ActionKind::Put, Some(token.to_string()), locker_id);
        self.unlock(session).await
    }

    /// Collect from a locker.
    #[tracing::instrument(skip(self, token))]
    pub async fn take(&self, token: &str, locker_id: &str) -> Result<UnlockPath> {
        let session = RequestSession::new(ActionKind::Take, Some(token.to_string()), locker_id);
        self.unlock(session).await
    }

    /// Open a locker for maintenance.
    #[tracing::instrument(skip(self, token))]
    pub async fn open_for_maintenance(&self, token: &str, locker_id: &str) -> Result<UnlockPath> {
        let session = RequestSession::new(
            ActionKind::OpenForMaintenance,
            Some(token.to_string()),
            locker_id,
        );
        self.unlock(session).await
    }

    /// Read the locker's status payload without writing.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, locker_id: &str) -> Result<String> {
        match self.run(RequestSession::read(locker_id)).await? {
            SessionOutcome::Payload(payload) => Ok(payload),
            // A read handshake only ever ends with a payload
            SessionOutcome::Unlocked(_) => Err(Error::SessionAborted),
        }
    }

    async fn unlock(&self, session: RequestSession) -> Result<UnlockPath> {
        match self.run(session).await? {
            SessionOutcome::Unlocked(path) => Ok(path),
            SessionOutcome::Payload(_) => Err(Error::SessionAborted),
        }
    }

    /// Run one session to its outcome.
    ///
    /// The session task keeps the client busy until it finishes, even if
    /// the returned future is dropped early.
    pub async fn run(&self, session: RequestSession) -> Result<SessionOutcome> {
        let guard = BusyGuard::acquire(&self.busy)?;

        if session.action.requires_token() && session.token.is_none() {
            return Err(Error::MissingToken(session.action));
        }
        if session.action.writes_key() && self.collaborators.keys.is_none() {
            return Err(Error::invalid_config(format!(
                "action '{}' needs a key service",
                session.action
            )));
        }

        let (completion, outcome) = Completion::new();
        let driver = SessionDriver::new(session, self.config.clone(), self.collaborators.clone());
        tokio::spawn(async move {
            let mut completion = completion;
            let result = driver.run().await;
            // Free the client before the caller sees the outcome
            drop(guard);
            completion.resolve(result);
        });

        outcome.await.unwrap_or_else(|_| {
            warn!("Session task ended without an outcome");
            Err(Error::SessionAborted)
        })
    }
}

/// Builder for [`LockerClient`].
#[must_use]
pub struct LockerClientBuilder {
    collaborators: Collaborators,
    config: ClientConfig,
}

impl LockerClientBuilder {
    /// Create a builder around `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            collaborators: Collaborators {
                transport,
                keys: None,
                directory: None,
                network: None,
                location: None,
                prompt: None,
            },
            config: ClientConfig::default(),
        }
    }

    /// Set the key service. Required for every action except `read`.
    pub fn key_service(mut self, keys: Arc<dyn KeyService>) -> Self {
        self.collaborators.keys = Some(keys);
        self
    }

    /// Set the locker directory used to detect network-capable lockers.
    pub fn directory(mut self, directory: Arc<dyn LockerDirectory>) -> Self {
        self.collaborators.directory = Some(directory);
        self
    }

    /// Set the network unlock client.
    pub fn network(mut self, network: Arc<dyn NetworkClient>) -> Self {
        self.collaborators.network = Some(network);
        self
    }

    /// Set the location provider.
    pub fn location(mut self, location: Arc<dyn LocationProvider>) -> Self {
        self.collaborators.location = Some(location);
        self
    }

    /// Set the remediation prompt shown when location access is denied.
    pub fn prompt(mut self, prompt: Arc<dyn RemediationPrompt>) -> Self {
        self.collaborators.prompt = Some(prompt);
        self
    }

    /// Set the session configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<LockerClient> {
        self.config.validate()?;
        Ok(LockerClient {
            collaborators: self.collaborators,
            config: self.config,
            busy: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockKeyService, MockTransport, Reply};

    #[test]
    fn test_config_presets_valid() {
        assert!(ClientConfig::default().validate().is_ok());
        assert!(ClientConfig::fast().validate().is_ok());
        assert!(ClientConfig::challenging_environment().validate().is_ok());
        assert!(
            ClientConfig::fast().stage_timeouts.connecting
                < ClientConfig::challenging_environment().stage_timeouts.connecting
        );
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let transport = Arc::new(MockTransport::new());
        let config = ClientConfig::default().retry(RetryPolicy::new(0));
        let result = LockerClient::builder(transport).config(config).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_busy_guard() {
        let busy = Arc::new(AtomicBool::new(false));
        let guard = BusyGuard::acquire(&busy).unwrap();
        assert!(matches!(BusyGuard::acquire(&busy), Err(Error::Busy)));
        drop(guard);
        assert!(BusyGuard::acquire(&busy).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_session_is_busy() {
        let transport = Arc::new(
            MockTransport::new()
                .with_locker("locker-1")
                .with_connect(Reply::Silent),
        );
        // A single attempt, so the silent connect ends the first session
        let client = Arc::new(
            LockerClient::builder(transport.clone())
                .key_service(Arc::new(MockKeyService::new()))
                .config(ClientConfig::default().retry(RetryPolicy::none()))
                .build()
                .unwrap(),
        );

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.put("token", "locker-1").await }
        });
        while !client.is_busy() {
            tokio::task::yield_now().await;
        }

        let err = client.take("token", "locker-1").await.unwrap_err();
        assert!(matches!(err, Error::Busy));

        // The first session still runs to its own outcome
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
        assert!(err.is_timeout());
        assert!(!client.is_busy());
    }

    #[tokio::test]
    async fn test_write_action_needs_key_service() {
        let transport = Arc::new(MockTransport::new());
        let client = LockerClient::builder(transport.clone()).build().unwrap();

        let err = client.put("token", "locker-1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(transport.calls().await.is_empty());
        assert!(!client.is_busy());
    }
}
