//! Location-authenticated network fallback.
//!
//! When a locker prefers the network path, [`LocationFallback`] obtains one
//! location fix (asking for permission when needed) and hands the action to
//! the [`NetworkClient`]. A [`LocationRequest`] tracks the single in-flight
//! fix so overlapping triggers never issue a second request.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use locker_types::{ActionKind, Coordinates};

use crate::error::{Error, Result};
use crate::session::RequestSession;
use crate::traits::{AuthorizationStatus, LocationProvider, NetworkClient, RemediationPrompt};

/// State of the one-shot location request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocationRequest {
    /// No fix requested yet.
    #[default]
    Idle,
    /// A fix has been requested and not answered.
    Pending,
    /// The fix request was answered.
    Resolved,
}

impl LocationRequest {
    /// Claim the request. Returns `true` only on the first call; while a
    /// request is pending or after it resolved this is a no-op.
    pub fn begin(&mut self) -> bool {
        match self {
            LocationRequest::Idle => {
                *self = LocationRequest::Pending;
                true
            }
            LocationRequest::Pending | LocationRequest::Resolved => false,
        }
    }

    /// Mark the pending request answered. Returns `false` if nothing was
    /// pending.
    pub fn resolve(&mut self) -> bool {
        match self {
            LocationRequest::Pending => {
                *self = LocationRequest::Resolved;
                true
            }
            LocationRequest::Idle | LocationRequest::Resolved => false,
        }
    }

    /// Whether a fix is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(self, LocationRequest::Pending)
    }
}

/// Runs the network unlock path for one session.
pub struct LocationFallback {
    location: Arc<dyn LocationProvider>,
    network: Arc<dyn NetworkClient>,
    prompt: Option<Arc<dyn RemediationPrompt>>,
    request: LocationRequest,
}

impl std::fmt::Debug for LocationFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationFallback")
            .field("request", &self.request)
            .field("has_prompt", &self.prompt.is_some())
            .finish()
    }
}

impl LocationFallback {
    /// Create a fallback coordinator.
    pub fn new(
        location: Arc<dyn LocationProvider>,
        network: Arc<dyn NetworkClient>,
        prompt: Option<Arc<dyn RemediationPrompt>>,
    ) -> Self {
        Self {
            location,
            network,
            prompt,
            request: LocationRequest::Idle,
        }
    }

    /// State of the location request.
    pub fn request_state(&self) -> LocationRequest {
        self.request
    }

    /// Obtain a fix and run the session's action over the network.
    ///
    /// `cause` is the wireless failure that triggered the fallback; it is
    /// reported if no fix can be obtained. Network errors are returned
    /// unchanged. With permission denied this waits until the user grants
    /// access, so callers should bound it with their own timeout.
    #[tracing::instrument(skip(self, session, cause), fields(locker = %session.locker_id, action = %session.action))]
    pub async fn run(&mut self, session: &RequestSession, cause: Error) -> Result<()> {
        let token = match session.token.as_deref() {
            Some(token) if session.action.has_network_fallback() => token,
            Some(_) => return Err(cause),
            None => return Err(Error::MissingToken(session.action)),
        };

        let coordinates = match self.locate().await {
            Ok(coordinates) => coordinates,
            Err(Error::LocationPermissionDenied) => return Err(Error::LocationPermissionDenied),
            Err(e) => {
                warn!(error = %e, "Location fix failed, reporting the wireless failure");
                return Err(cause);
            }
        };

        info!(lat = coordinates.lat, lng = coordinates.lng, "Location fix obtained");
        let result = match session.action {
            ActionKind::Put => self.network.put(token, &session.locker_id, coordinates).await,
            ActionKind::Take => self.network.take(token, &session.locker_id, coordinates).await,
            ActionKind::OpenForMaintenance => {
                self.network
                    .open_for_maintenance(token, &session.locker_id, coordinates)
                    .await
            }
            ActionKind::Read => return Err(cause),
        };

        match &result {
            Ok(()) => info!("Network request succeeded"),
            Err(e) => warn!(error = %e, "Network request failed"),
        }
        result
    }

    /// Get one location fix, honoring the permission state.
    async fn locate(&mut self) -> Result<Coordinates> {
        // Subscribe before querying so a change in between is not missed
        let mut changes = self.location.authorization_changes();
        let mut changes_open = true;
        let mut fix: Option<BoxFuture<'static, Result<Coordinates>>> = None;

        let status = self.location.authorization_status().await;
        debug!(?status, "Location authorization");
        match status {
            AuthorizationStatus::NotDetermined => {
                self.location.request_authorization().await;
                fix = self.request_fix();
            }
            AuthorizationStatus::Authorized => fix = self.request_fix(),
            AuthorizationStatus::Denied | AuthorizationStatus::Restricted => self.remediate(status),
        }

        loop {
            if fix.is_none() && !changes_open {
                return Err(Error::LocationPermissionDenied);
            }

            tokio::select! {
                result = async {
                    match fix.as_mut() {
                        Some(pending) => pending.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.request.resolve();
                    return result;
                }
                change = changes.next(), if changes_open => match change {
                    Some(status) if status.is_authorized() => {
                        debug!("Location permission granted");
                        if let Some(request) = self.request_fix() {
                            fix = Some(request);
                        }
                    }
                    Some(status) => {
                        if fix.is_none() && status.needs_remediation() {
                            self.remediate(status);
                        }
                    }
                    None => changes_open = false,
                },
            }
        }
    }

    fn request_fix(&mut self) -> Option<BoxFuture<'static, Result<Coordinates>>> {
        if !self.request.begin() {
            debug!(state = ?self.request, "Location request already issued");
            return None;
        }
        let location = Arc::clone(&self.location);
        Some(async move { location.request_location().await }.boxed())
    }

    fn remediate(&self, status: AuthorizationStatus) {
        warn!(?status, "Location permission unavailable");
        if let Some(prompt) = &self.prompt {
            prompt.show_location_settings();
        }
    }
}
